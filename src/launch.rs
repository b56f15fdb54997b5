//! The whole launch, in order.

use log::debug;
use nix::unistd::{getegid, geteuid};
use std::convert::Infallible;
use std::ffi::OsString;

use crate::error::Error;
use crate::exec::{login_shell, CommandSpec};
use crate::locate::Locator;
use crate::namespace::{self, Auto, Joiner};
use crate::privilege::{with_elevation, CallerIdentity, IdentityOps, ProcessIdentity};
use crate::ready::{Connect, Poller, SystemBus};
use crate::relay;

pub struct Launcher<O, C, J> {
    caller: CallerIdentity,
    locator: Locator,
    poller: Poller,
    ops: O,
    bus: C,
    joiner: J,
}

impl Launcher<ProcessIdentity, SystemBus, Auto> {
    /// The real thing: `/proc`, the system bus and the process's own ids.
    pub fn system() -> Self {
        let locator = Locator::default();
        let joiner = Auto::new(locator.clone());
        Launcher::new(locator, Poller::default(), ProcessIdentity, SystemBus, joiner)
    }
}

impl<O: IdentityOps, C: Connect, J: Joiner> Launcher<O, C, J> {
    pub fn new(locator: Locator, poller: Poller, ops: O, bus: C, joiner: J) -> Self {
        Launcher {
            caller: CallerIdentity::current(),
            locator,
            poller,
            ops,
            bus,
            joiner,
        }
    }

    /// Find systemd, wait for it, join it and exec `args` (or the login
    /// shell). Only returns on failure, in the parent or the child.
    pub fn run(&mut self, args: &[OsString], shell: Option<OsString>) -> Result<Infallible, Error> {
        debug!("starting with arguments {:?}", args);
        debug!(
            "uid: {}, gid: {}, euid: {}, egid: {}",
            self.caller.uid,
            self.caller.gid,
            geteuid(),
            getegid()
        );

        let target = self.locator.find()?;
        debug!("systemd is pid {}", target.pid);
        if !self.poller.wait_isolated(&mut self.bus) {
            return Err(Error::NotReady);
        }

        // Enter systemd's namespaces as root, then go back to being the caller.
        let joiner = &self.joiner;
        with_elevation(&mut self.ops, self.caller, || {
            namespace::enter(&target, joiner)
        })?;

        let shell = login_shell(shell, self.caller.uid);
        let command = CommandSpec::resolve(args, shell)?;

        relay::continue_as_child()?;
        command.exec()
    }
}
