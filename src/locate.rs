//! Find the system manager by walking the proc filesystem.

use log::{trace, warn};
use nix::errno::Errno;
use nix::unistd::{Gid, Pid, Uid};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::vec;

use crate::error::Error;

const INIT_NAME: &str = "systemd";

// Pid 1 belongs to the distro's own init, not to systemd.
const FIRST_PID: i32 = 2;

/// The located init process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: Pid,
    pub uid: Uid,
    pub gid: Gid,
}

#[derive(Clone, Debug)]
pub struct Locator {
    proc_root: PathBuf,
    name: String,
    uid: Uid,
    gid: Gid,
    first_pid: i32,
}

impl Default for Locator {
    fn default() -> Self {
        Locator {
            proc_root: PathBuf::from("/proc"),
            name: INIT_NAME.to_string(),
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            first_pid: FIRST_PID,
        }
    }
}

impl Locator {
    pub fn proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn owner(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_root
    }

    /// Lowest-pid process that looks like the system manager.
    pub fn find(&self) -> Result<TargetProcess, Error> {
        self.candidates()?.next().ok_or(Error::NotFound)
    }

    /// Matching processes in ascending pid order.
    pub fn candidates(&self) -> Result<Candidates<'_>, Error> {
        let scan_err = |source| Error::ProcScan {
            path: self.proc_root.clone(),
            source,
        };
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.proc_root).map_err(scan_err)? {
            let entry = entry.map_err(scan_err)?;
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            if pid >= self.first_pid {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(Candidates {
            locator: self,
            pids: pids.into_iter(),
        })
    }

    /// Re-check a single pid, e.g. after a handle to it has been taken.
    pub fn matches(&self, pid: Pid) -> bool {
        self.inspect(pid.as_raw()).is_some()
    }

    fn inspect(&self, pid: i32) -> Option<TargetProcess> {
        let dir = self.proc_root.join(pid.to_string());
        match self.examine(&dir) {
            Ok(found) => found.map(|(uid, gid)| TargetProcess {
                pid: Pid::from_raw(pid),
                uid,
                gid,
            }),
            Err(err) if is_scan_noise(&err) => {
                trace!("skipping {}: {}", dir.display(), err);
                None
            }
            Err(err) => {
                warn!("skipping {}: {}", dir.display(), err);
                None
            }
        }
    }

    fn examine(&self, dir: &Path) -> io::Result<Option<(Uid, Gid)>> {
        let target = fs::read_link(dir.join("exe"))?;
        if exe_basename(&target) != Some(self.name.as_str()) {
            return Ok(None);
        }
        // The directory carries the process credentials, the binary does not.
        let meta = fs::metadata(dir)?;
        let (uid, gid) = (Uid::from_raw(meta.uid()), Gid::from_raw(meta.gid()));
        if uid == self.uid && gid == self.gid {
            Ok(Some((uid, gid)))
        } else {
            Ok(None)
        }
    }
}

pub struct Candidates<'a> {
    locator: &'a Locator,
    pids: vec::IntoIter<i32>,
}

impl Iterator for Candidates<'_> {
    type Item = TargetProcess;

    fn next(&mut self) -> Option<TargetProcess> {
        let locator = self.locator;
        self.pids.find_map(|pid| locator.inspect(pid))
    }
}

fn exe_basename(target: &Path) -> Option<&str> {
    let name = target.file_name()?.to_str()?;
    Some(name.strip_suffix(" (deleted)").unwrap_or(name))
}

// Processes come and go during a scan, kernel threads have no exe, and
// without privileges most links are unreadable.
fn is_scan_noise(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => true,
        _ => err.raw_os_error() == Some(Errno::ESRCH as i32),
    }
}
