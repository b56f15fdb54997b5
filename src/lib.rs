//! Log into the namespaces of a detached systemd.
//!
//! The pieces run in this order: find systemd ([`locate`]), wait for it to
//! boot ([`ready`]), raise privileges ([`privilege`]) just long enough to join
//! its PID and mount namespaces ([`namespace`]), fork ([`relay`]) and exec the
//! user's command ([`exec`]). [`launch`] strings them together.

pub mod error;
pub mod exec;
pub mod launch;
pub mod locate;
pub mod namespace;
pub mod privilege;
pub mod ready;
pub mod relay;

pub use error::{Error, Stage};
