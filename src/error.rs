use nix::errno::Errno;
use nix::unistd::Pid;
use std::ffi::NulError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::namespace::Namespace;

/// Where the launch failed. The discriminant is the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Stage {
    Locate = 1,
    ElevateGroup = 2,
    ElevateUser = 3,
    Join = 4,
    RestoreUser = 5,
    RestoreGroup = 6,
    Exec = 7,
    WaitReady = 8,
    NamespaceOpen = 9,
    Relay = 10,
}

impl Stage {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Locate => "locate",
            Stage::ElevateGroup | Stage::ElevateUser => "elevate",
            Stage::Join | Stage::NamespaceOpen => "join",
            Stage::RestoreUser | Stage::RestoreGroup => "restore",
            Stage::Exec => "exec",
            Stage::WaitReady => "wait-ready",
            Stage::Relay => "relay",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("systemd is not running")]
    NotFound,

    #[error("failed to scan {}: {source}", .path.display())]
    ProcScan { path: PathBuf, source: io::Error },

    #[error("systemd did not finish booting in time")]
    NotReady,

    #[error("setegid as root: {0}")]
    ElevateGroup(#[source] Errno),

    #[error("seteuid as root: {0}")]
    ElevateUser(#[source] Errno),

    #[error("failed to open {kind} namespace of process {pid}: {source}")]
    NamespaceOpen {
        pid: Pid,
        kind: Namespace,
        source: io::Error,
    },

    #[error("failed to open a process handle for {pid}: {source}")]
    ProcessHandle { pid: Pid, source: Errno },

    #[error("process {0} exited or is no longer systemd")]
    TargetGone(Pid),

    #[error("failed to set {kind} namespace to process {pid}'s: {source}")]
    Join {
        pid: Pid,
        kind: String,
        source: Errno,
    },

    #[error("seteuid back as user: {0}")]
    RestoreUser(#[source] Errno),

    #[error("setegid back as user: {0}")]
    RestoreGroup(#[source] Errno),

    #[error("executing {program:?} failed: {source}")]
    Exec { program: String, source: Errno },

    #[error("relaying for child {child}: {source}")]
    Relay { child: Pid, source: Errno },

    #[error("argument contains an interior nul byte")]
    InvalidArgument(#[from] NulError),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::NotFound | Error::ProcScan { .. } => Stage::Locate,
            Error::NotReady => Stage::WaitReady,
            Error::ElevateGroup(_) => Stage::ElevateGroup,
            Error::ElevateUser(_) => Stage::ElevateUser,
            Error::NamespaceOpen { .. } | Error::ProcessHandle { .. } | Error::TargetGone(_) => {
                Stage::NamespaceOpen
            }
            Error::Join { .. } => Stage::Join,
            Error::RestoreUser(_) => Stage::RestoreUser,
            Error::RestoreGroup(_) => Stage::RestoreGroup,
            Error::Exec { .. } | Error::InvalidArgument(_) => Stage::Exec,
            Error::Relay { .. } => Stage::Relay,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.stage().exit_code()
    }

    /// Whether terminating the distro instance is the likely fix.
    pub fn wants_restart(&self) -> bool {
        matches!(self.stage(), Stage::Locate | Stage::WaitReady)
    }
}
