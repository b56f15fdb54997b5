//! Effective-identity bracketing around the namespace join.
//!
//! The binary is installed setuid root. Everything that needs root runs
//! between [`Elevated::raise`] and [`Elevated::restore`]; nothing the user
//! controls (command lookup, exec) may run in between.

use log::{debug, error};
use nix::errno::Errno;
use nix::unistd::{getgid, getuid, Gid, Uid};
use std::process;

use crate::error::Error;

/// The real ids of whoever invoked us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: Uid,
    pub gid: Gid,
}

impl CallerIdentity {
    pub fn current() -> Self {
        CallerIdentity {
            uid: getuid(),
            gid: getgid(),
        }
    }
}

/// The effective-id calls the bracket is made of.
pub trait IdentityOps {
    fn set_egid(&mut self, gid: Gid) -> Result<(), Errno>;
    fn set_euid(&mut self, uid: Uid) -> Result<(), Errno>;
}

/// The calling process itself.
#[derive(Debug, Default)]
pub struct ProcessIdentity;

impl IdentityOps for ProcessIdentity {
    fn set_egid(&mut self, gid: Gid) -> Result<(), Errno> {
        nix::unistd::setegid(gid)
    }

    fn set_euid(&mut self, uid: Uid) -> Result<(), Errno> {
        nix::unistd::seteuid(uid)
    }
}

/// Root effective identity, held until restored or dropped.
pub struct Elevated<'a, O: IdentityOps> {
    ops: &'a mut O,
    caller: CallerIdentity,
    restored: bool,
}

impl<'a, O: IdentityOps> Elevated<'a, O> {
    pub fn raise(ops: &'a mut O, caller: CallerIdentity) -> Result<Self, Error> {
        ops.set_egid(Gid::from_raw(0)).map_err(Error::ElevateGroup)?;
        if let Err(errno) = ops.set_euid(Uid::from_raw(0)) {
            // Do not leave a half-raised identity behind.
            ops.set_egid(caller.gid).map_err(Error::RestoreGroup)?;
            return Err(Error::ElevateUser(errno));
        }
        debug!("raised effective identity to root");
        Ok(Elevated {
            ops,
            caller,
            restored: false,
        })
    }

    /// Drop back to the caller's ids: user first, then group.
    pub fn restore(mut self) -> Result<(), Error> {
        self.restored = true;
        self.lower()
    }

    fn lower(&mut self) -> Result<(), Error> {
        self.ops
            .set_euid(self.caller.uid)
            .map_err(Error::RestoreUser)?;
        self.ops
            .set_egid(self.caller.gid)
            .map_err(Error::RestoreGroup)?;
        debug!(
            "restored effective identity to {}:{}",
            self.caller.uid, self.caller.gid
        );
        Ok(())
    }
}

impl<O: IdentityOps> Drop for Elevated<'_, O> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = self.lower() {
            // Running on with the wrong identity is not an option.
            error!("{}", err);
            eprintln!("nslogin: {}", err);
            process::exit(err.exit_code());
        }
    }
}

/// Run `f` with root effective ids, restoring the caller's ids afterwards
/// whether or not `f` succeeded. A restore failure takes precedence over
/// the error from `f`.
pub fn with_elevation<O, T, F>(ops: &mut O, caller: CallerIdentity, f: F) -> Result<T, Error>
where
    O: IdentityOps,
    F: FnOnce() -> Result<T, Error>,
{
    let guard = Elevated::raise(ops, caller)?;
    let result = f();
    guard.restore()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Egid(u32),
        Euid(u32),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        fail_on: Option<usize>,
        euid: u32,
        egid: u32,
    }

    impl Recorder {
        fn failing_at(n: usize) -> Self {
            Recorder {
                fail_on: Some(n),
                euid: 1000,
                egid: 1000,
                ..Default::default()
            }
        }

        fn as_user() -> Self {
            Recorder {
                euid: 1000,
                egid: 1000,
                ..Default::default()
            }
        }

        fn check(&self) -> Result<(), Errno> {
            if self.fail_on == Some(self.calls.len() - 1) {
                Err(Errno::EPERM)
            } else {
                Ok(())
            }
        }
    }

    impl IdentityOps for Recorder {
        fn set_egid(&mut self, gid: Gid) -> Result<(), Errno> {
            self.calls.push(Call::Egid(gid.as_raw()));
            self.check()?;
            self.egid = gid.as_raw();
            Ok(())
        }

        fn set_euid(&mut self, uid: Uid) -> Result<(), Errno> {
            self.calls.push(Call::Euid(uid.as_raw()));
            self.check()?;
            self.euid = uid.as_raw();
            Ok(())
        }
    }

    fn user() -> CallerIdentity {
        CallerIdentity {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
        }
    }

    #[test]
    fn raises_group_first_and_restores_user_first() {
        let mut ops = Recorder::as_user();
        let seen = with_elevation(&mut ops, user(), || Ok(42)).unwrap();

        assert_eq!(seen, 42);
        assert_eq!(
            ops.calls,
            vec![
                Call::Egid(0),
                Call::Euid(0),
                Call::Euid(1000),
                Call::Egid(1000)
            ]
        );
        assert_eq!((ops.euid, ops.egid), (1000, 1000));
    }

    #[test]
    fn restores_when_the_critical_section_fails() {
        let mut ops = Recorder::as_user();
        let result: Result<(), Error> = with_elevation(&mut ops, user(), || Err(Error::NotFound));

        assert!(matches!(result, Err(Error::NotFound)));
        assert_eq!((ops.euid, ops.egid), (1000, 1000));
    }

    #[test]
    fn critical_section_runs_as_root() {
        let mut ops = Recorder::as_user();
        let guard = Elevated::raise(&mut ops, user()).unwrap();
        assert_eq!((guard.ops.euid, guard.ops.egid), (0, 0));
        guard.restore().unwrap();
        assert_eq!((ops.euid, ops.egid), (1000, 1000));
    }

    #[test]
    fn each_step_has_its_own_exit_code() {
        let codes: Vec<i32> = (0..4)
            .map(|step| {
                let mut ops = Recorder::failing_at(step);
                with_elevation(&mut ops, user(), || Ok(()))
                    .unwrap_err()
                    .exit_code()
            })
            .collect();
        assert_eq!(codes, vec![2, 3, 5, 6]);
    }

    #[test]
    fn failed_user_raise_rolls_back_the_group() {
        let mut ops = Recorder::failing_at(1);
        let err = Elevated::raise(&mut ops, user()).err().unwrap();

        assert!(matches!(err, Error::ElevateUser(Errno::EPERM)));
        assert_eq!(ops.calls.last(), Some(&Call::Egid(1000)));
        assert_eq!(ops.egid, 1000);
    }

    #[test]
    fn dropping_the_guard_restores() {
        let mut ops = Recorder::as_user();
        {
            let _guard = Elevated::raise(&mut ops, user()).unwrap();
        }
        assert_eq!((ops.euid, ops.egid), (1000, 1000));
        assert_eq!(ops.calls.len(), 4);
    }

    #[test]
    fn real_process_ends_with_the_caller_identity() {
        // Only succeeds in elevating when the tests run as root; either way
        // the effective ids must be back where they started.
        let caller = CallerIdentity::current();
        let mut ops = ProcessIdentity;
        let _ = with_elevation(&mut ops, caller, || -> Result<(), Error> { Err(Error::NotReady) });

        assert_eq!(nix::unistd::geteuid(), caller.uid);
        assert_eq!(nix::unistd::getegid(), caller.gid);
    }
}
