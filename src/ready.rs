//! Waiting for systemd to finish booting.
//!
//! The zbus client starts helper threads that never exit, and a process
//! with more than one thread cannot `setns` into a mount namespace. So the
//! launcher asks a forked helper ([`Poller::wait_isolated`]) and only reads
//! its exit status.

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::thread;
use std::time::Duration;
use zbus::blocking::Connection;
use zbus::zvariant::OwnedValue;

const SERVICE: &str = "org.freedesktop.systemd1";
const OBJECT: &str = "/org/freedesktop/systemd1";
const MANAGER: &str = "org.freedesktop.systemd1.Manager";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

const RETRIES: u32 = 19;
const INTERVAL: Duration = Duration::from_millis(500);

/// Something that reports the manager's `SystemState`.
pub trait StateSource {
    fn system_state(&mut self) -> zbus::Result<String>;
}

/// Opens a [`StateSource`]; the bus may not be up yet.
pub trait Connect {
    type Source: StateSource;

    fn connect(&mut self) -> zbus::Result<Self::Source>;
}

/// The D-Bus system bus.
#[derive(Debug, Default)]
pub struct SystemBus;

pub struct SystemBusConnection {
    conn: Connection,
}

impl Connect for SystemBus {
    type Source = SystemBusConnection;

    fn connect(&mut self) -> zbus::Result<SystemBusConnection> {
        Ok(SystemBusConnection {
            conn: Connection::system()?,
        })
    }
}

impl StateSource for SystemBusConnection {
    fn system_state(&mut self) -> zbus::Result<String> {
        // A plain Properties.Get, so no cached value is ever returned.
        let reply = self.conn.call_method(
            Some(SERVICE),
            OBJECT,
            Some(PROPERTIES),
            "Get",
            &(MANAGER, "SystemState"),
        )?;
        let value: OwnedValue = reply.body().deserialize()?;
        Ok(String::try_from(value)?)
    }
}

/// States in which systemd is still bringing the system up.
pub fn is_booting(state: &str) -> bool {
    state.starts_with("initializing") || state.starts_with("starting")
}

#[derive(Clone, Debug)]
pub struct Poller {
    retries: u32,
    interval: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Poller {
            retries: RETRIES,
            interval: INTERVAL,
        }
    }
}

impl Poller {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Poller { retries, interval }
    }

    /// Block until a booted state is observed. Connecting and querying draw
    /// from the same retry budget; running out of it is never success.
    pub fn wait<C: Connect>(&self, connector: &mut C) -> bool {
        let mut attempts = 0;

        let mut source = loop {
            match connector.connect() {
                Ok(source) => break source,
                Err(err) => {
                    debug!("system bus not reachable yet: {}", err);
                    if attempts >= self.retries {
                        warn!("gave up connecting to the system bus: {}", err);
                        return false;
                    }
                }
            }
            attempts += 1;
            thread::sleep(self.interval);
        };

        loop {
            match source.system_state() {
                Ok(state) if !is_booting(&state) => {
                    debug!("systemd state is {:?}", state);
                    return true;
                }
                Ok(state) => debug!("systemd still {:?}", state),
                Err(err) => warn!("bus error reading SystemState: {}", err),
            }
            if attempts >= self.retries {
                warn!("systemd did not finish booting after {} attempts", attempts + 1);
                return false;
            }
            attempts += 1;
            thread::sleep(self.interval);
        }
    }

    /// [`Poller::wait`] in a forked helper; exit status 0 means ready. Any
    /// threads the bus client starts die with the helper.
    pub fn wait_isolated<C: Connect>(&self, connector: &mut C) -> bool {
        // SAFETY: the helper polls and leaves through _exit, never returning
        // into the caller's code.
        let helper = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let ready = self.wait(connector);
                // SAFETY: _exit skips atexit handlers and stdio buffers that
                // belong to the parent.
                unsafe { libc::_exit(if ready { 0 } else { 1 }) }
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(err) => {
                warn!("cannot fork the readiness helper: {}", err);
                return false;
            }
        };

        loop {
            match waitpid(helper, None) {
                Ok(WaitStatus::Exited(_, code)) => return code == 0,
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    warn!("readiness helper killed by {:?}", sig);
                    return false;
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("waiting for the readiness helper: {}", err);
                    return false;
                }
            }
        }
    }
}
