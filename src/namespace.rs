//! Joining the PID and mount namespaces of another process.
//!
//! Two ways to get there: open `/proc/<pid>/ns/{pid,mnt}` and `setns` each,
//! or take a pidfd and join both kinds with one `setns` call. [`Auto`] picks
//! the pidfd route when the kernel supports it. Either way every descriptor
//! is closed before `join` returns.

use caps::{CapSet, Capability};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use std::env;
use std::fmt;
use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;

use crate::error::Error;
use crate::locate::{Locator, TargetProcess};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Namespace {
    Pid,
    Mount,
}

impl Namespace {
    /// Both kinds, in join order.
    pub const ALL: [Namespace; 2] = [Namespace::Pid, Namespace::Mount];

    /// Name of the file under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            Namespace::Pid => "pid",
            Namespace::Mount => "mnt",
        }
    }

    pub fn flag(self) -> CloneFlags {
        match self {
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Mount => CloneFlags::CLONE_NEWNS,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

pub trait Joiner {
    /// Move the calling process into `target`'s namespaces of the given kinds.
    fn join(&self, target: &TargetProcess, kinds: &[Namespace]) -> Result<(), Error>;
}

// Deterministic order no matter how the caller listed them.
fn ordered(kinds: &[Namespace]) -> Vec<Namespace> {
    let mut kinds = kinds.to_vec();
    kinds.sort();
    kinds.dedup();
    kinds
}

/// One `/proc/<pid>/ns/<kind>` file per namespace.
#[derive(Clone, Debug)]
pub struct NsFiles {
    locator: Locator,
}

impl NsFiles {
    pub fn new(locator: Locator) -> Self {
        NsFiles { locator }
    }

    fn path(&self, pid: Pid, kind: Namespace) -> PathBuf {
        self.locator
            .proc_path()
            .join(pid.to_string())
            .join("ns")
            .join(kind.proc_name())
    }
}

impl Joiner for NsFiles {
    fn join(&self, target: &TargetProcess, kinds: &[Namespace]) -> Result<(), Error> {
        let pid = target.pid;

        // Open everything first: once in the new mount namespace these paths
        // may resolve to something else.
        let mut handles = Vec::new();
        for kind in ordered(kinds) {
            let file = File::open(self.path(pid, kind)).map_err(|source| Error::NamespaceOpen {
                pid,
                kind,
                source,
            })?;
            handles.push((kind, file));
        }
        if !self.locator.matches(pid) {
            return Err(Error::TargetGone(pid));
        }

        for (kind, file) in handles {
            setns(&file, kind.flag()).map_err(|source| Error::Join {
                pid,
                kind: kind.to_string(),
                source,
            })?;
            debug!("joined {} namespace of {}", kind, pid);
        }
        Ok(())
    }
}

/// A pidfd joined with a single combined `setns` (Linux 5.8+).
#[derive(Clone, Debug)]
pub struct PidFd {
    locator: Locator,
}

impl PidFd {
    pub fn new(locator: Locator) -> Self {
        PidFd { locator }
    }

    fn open(pid: Pid) -> Result<OwnedFd, Errno> {
        // SAFETY: pidfd_open takes a pid and a flags word and returns a new
        // descriptor or -1.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if fd < 0 {
            return Err(Errno::last());
        }
        // SAFETY: the descriptor was just created and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
    }
}

impl Joiner for PidFd {
    fn join(&self, target: &TargetProcess, kinds: &[Namespace]) -> Result<(), Error> {
        let pid = target.pid;
        let pidfd = PidFd::open(pid).map_err(|source| Error::ProcessHandle { pid, source })?;
        // The handle pins the process, so a pid reused after the scan shows
        // up here and not after the join.
        if !self.locator.matches(pid) {
            return Err(Error::TargetGone(pid));
        }

        let kinds = ordered(kinds);
        let flags = kinds
            .iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.flag());
        setns(&pidfd, flags).map_err(|source| Error::Join {
            pid,
            kind: names(&kinds),
            source,
        })?;
        debug!("joined {} namespaces of {} via pidfd", names(&kinds), pid);
        Ok(())
    }
}

fn names(kinds: &[Namespace]) -> String {
    kinds
        .iter()
        .map(|kind| kind.proc_name())
        .collect::<Vec<_>>()
        .join("+")
}

/// Pidfd when the kernel has it, namespace files otherwise.
#[derive(Clone, Debug)]
pub struct Auto {
    pidfd: PidFd,
    files: NsFiles,
}

impl Auto {
    pub fn new(locator: Locator) -> Self {
        Auto {
            pidfd: PidFd::new(locator.clone()),
            files: NsFiles::new(locator),
        }
    }
}

impl Joiner for Auto {
    fn join(&self, target: &TargetProcess, kinds: &[Namespace]) -> Result<(), Error> {
        match self.pidfd.join(target, kinds) {
            // No pidfd_open, or a setns that does not take pidfds. The
            // combined setns is all or nothing, so nothing was joined yet.
            Err(Error::ProcessHandle {
                source: Errno::ENOSYS,
                ..
            })
            | Err(Error::Join {
                source: Errno::EINVAL,
                ..
            }) => {
                debug!("pidfd joins unsupported, falling back to namespace files");
                self.files.join(target, kinds)
            }
            other => other,
        }
    }
}

// setns needs CAP_SYS_ADMIN, and CAP_SYS_CHROOT for mount namespaces.
fn preflight() {
    for cap in [Capability::CAP_SYS_ADMIN, Capability::CAP_SYS_CHROOT] {
        match caps::has_cap(None, CapSet::Effective, cap) {
            Ok(true) => {}
            Ok(false) => warn!("{} is not effective, joining will likely fail", cap),
            Err(err) => debug!("cannot read capabilities: {}", err),
        }
    }
}

/// Join `target`'s PID and mount namespaces, keeping the working directory
/// if it can be resolved before and after the switch.
pub fn enter<J: Joiner + ?Sized>(target: &TargetProcess, joiner: &J) -> Result<(), Error> {
    let cwd = match env::current_dir() {
        Ok(dir) => Some(dir),
        Err(err) => {
            debug!("not preserving the working directory: {}", err);
            None
        }
    };

    preflight();
    joiner.join(target, &Namespace::ALL)?;

    if let Some(dir) = cwd {
        if let Err(err) = env::set_current_dir(&dir) {
            warn!("attempt to keep working directory {}: {}", dir.display(), err);
        }
    }
    Ok(())
}
