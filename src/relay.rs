//! Fork once and let the parent mirror the child.
//!
//! A `setns` into a PID namespace only applies to children created
//! afterwards. Without this fork, shells running in the joined namespace fail
//! `setpgid` when setting up pipelines.

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::process;

use crate::error::{Error, Stage};

/// How the child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Exited(i32),
    Signaled(Signal),
}

impl Disposition {
    /// End this process the same way the child ended.
    pub fn mirror(self) -> ! {
        match self {
            Disposition::Exited(code) => process::exit(code),
            Disposition::Signaled(sig) => {
                // SAFETY: restoring the default action installs no handler.
                let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
                let _ = signal::raise(sig);
                error!("still alive after raising {:?}", sig);
                process::exit(Stage::Relay.exit_code())
            }
        }
    }
}

/// What the parent does about one wait notification.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// The child was suspended: suspend ourselves, then resume it.
    Suspend,
    Finish(Disposition),
    /// Nothing to do, keep waiting.
    Wait,
}

pub fn step(status: WaitStatus) -> Step {
    match status {
        WaitStatus::Stopped(..) => Step::Suspend,
        WaitStatus::Exited(_, code) => Step::Finish(Disposition::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Step::Finish(Disposition::Signaled(sig)),
        _ => Step::Wait,
    }
}

/// Suspends the supervising process.
pub trait Suspend {
    fn suspend(&mut self);
}

/// Stops the real process with `SIGSTOP`; returns once continued.
#[derive(Debug, Default)]
pub struct StopSelf;

impl Suspend for StopSelf {
    fn suspend(&mut self) {
        if let Err(err) = kill(getpid(), Signal::SIGSTOP) {
            error!("failed to stop: {}", err);
        }
    }
}

/// Wait for `child` to terminate, passing its stops on to us. Every stop
/// observed is answered with exactly one `SIGCONT` to the child.
pub fn supervise<S: Suspend>(child: Pid, suspender: &mut S) -> Result<Disposition, Errno> {
    loop {
        let status = match waitpid(child, Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        };
        match step(status) {
            Step::Suspend => {
                debug!("child {} stopped, stopping too", child);
                suspender.suspend();
                kill(child, Signal::SIGCONT)?;
            }
            Step::Finish(disposition) => return Ok(disposition),
            Step::Wait => {}
        }
    }
}

/// Fork; only the child returns `Ok`. The parent supervises the child and
/// ends the way it did, or returns the error that stopped it relaying. A
/// failed fork is reported and we carry on unforked.
pub fn continue_as_child() -> Result<(), Error> {
    // SAFETY: the child only execs or exits; the command line it needs was
    // built before forking.
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => return Ok(()),
        Ok(ForkResult::Parent { child }) => child,
        Err(err) => {
            error!("fork failed: {}", err);
            eprintln!("nslogin: fork failed: {}", err);
            return Ok(());
        }
    };

    supervise(child, &mut StopSelf)
        .map_err(|source| Error::Relay { child, source })?
        .mirror()
}
