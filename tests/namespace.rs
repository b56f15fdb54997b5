use nix::unistd::{getgid, getuid, Gid, Pid, Uid};
use std::env;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

use nslogin::locate::{Locator, TargetProcess};
use nslogin::namespace::{enter, Joiner, Namespace, NsFiles};
use nslogin::Error;

// The working directory and the descriptor table are per process.
static PROCESS: Mutex<()> = Mutex::new(());

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

fn fake_proc(with_ns: bool, with_exe: bool) -> (TempDir, TargetProcess) {
    let root = TempDir::new().unwrap();
    let dir = root.path().join("77");
    fs::create_dir_all(dir.join("ns")).unwrap();
    if with_ns {
        for kind in Namespace::ALL {
            fs::write(dir.join("ns").join(kind.proc_name()), b"").unwrap();
        }
    }
    if with_exe {
        symlink("/usr/lib/systemd/systemd", dir.join("exe")).unwrap();
    }
    let target = TargetProcess {
        pid: Pid::from_raw(77),
        uid: getuid(),
        gid: getgid(),
    };
    (root, target)
}

fn ns_files(root: &Path) -> NsFiles {
    NsFiles::new(
        Locator::default()
            .proc_root(root)
            .owner(getuid(), getgid()),
    )
}

/// Switches directory the way a mount namespace change does.
struct Relocating;

impl Joiner for Relocating {
    fn join(&self, _: &TargetProcess, kinds: &[Namespace]) -> Result<(), Error> {
        assert_eq!(kinds, &Namespace::ALL[..]);
        env::set_current_dir("/").unwrap();
        Ok(())
    }
}

fn root_target() -> TargetProcess {
    TargetProcess {
        pid: Pid::from_raw(1),
        uid: Uid::from_raw(0),
        gid: Gid::from_raw(0),
    }
}

#[test]
fn working_directory_survives_the_switch() {
    let _lock = PROCESS.lock().unwrap_or_else(|e| e.into_inner());
    let before = env::current_dir().unwrap();
    let dir = TempDir::new().unwrap();
    let dir_path = dir.path().canonicalize().unwrap();
    env::set_current_dir(&dir_path).unwrap();

    enter(&root_target(), &Relocating).unwrap();
    assert_eq!(env::current_dir().unwrap(), dir_path);

    env::set_current_dir(before).unwrap();
}

#[test]
fn rejected_join_closes_its_handles() {
    let _lock = PROCESS.lock().unwrap_or_else(|e| e.into_inner());
    let (root, target) = fake_proc(true, true);
    let fds = open_fds();

    // Plain files are not namespaces, so setns refuses them.
    let err = ns_files(root.path())
        .join(&target, &Namespace::ALL)
        .unwrap_err();
    assert!(matches!(err, Error::Join { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(open_fds(), fds);
}

#[test]
fn missing_namespace_files() {
    let _lock = PROCESS.lock().unwrap_or_else(|e| e.into_inner());
    let (root, target) = fake_proc(false, true);
    let fds = open_fds();

    let err = ns_files(root.path())
        .join(&target, &Namespace::ALL)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NamespaceOpen {
            kind: Namespace::Pid,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 9);
    assert_eq!(open_fds(), fds);
}

#[test]
fn target_replaced_after_the_scan() {
    let _lock = PROCESS.lock().unwrap_or_else(|e| e.into_inner());
    let (root, target) = fake_proc(true, false);
    let fds = open_fds();

    let err = ns_files(root.path())
        .join(&target, &Namespace::ALL)
        .unwrap_err();
    assert!(matches!(err, Error::TargetGone(pid) if pid == target.pid));
    assert_eq!(open_fds(), fds);
}
