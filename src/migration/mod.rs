//! Migration setup: the outgoing connector, the incoming acceptor and the
//! fault-tolerant receive handshake, all driven by one
//! [`MigrationSession`].
//!
//! The migration state machine itself (what is sent once connected) is out
//! of scope; it plugs in through the traits in [`crate::core`].

mod ft;
mod incoming;
mod mode;
mod outgoing;
mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use ft::{RunStateRegistry, RunStateToken};
pub use incoming::ListenerId;
pub use mode::{FtMode, FtModeCell};
pub use outgoing::{
    ConnectOutcome, MigrationHandle, MigrationStatus, OutgoingMigration, OutgoingParams,
    classify_connect,
};
pub use session::MigrationSession;
