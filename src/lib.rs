//! # vm-migration-tcp
//!
//! TCP transport setup for virtual-machine live migration.
//!
//! The crate establishes the connection a migration runs over and hands it
//! to the hypervisor; it does not define what is sent on the wire. It
//! provides:
//!
//! - **Outgoing**: non-blocking connect to `host:port`, reported exactly once
//!   to a [`MigrationSink`](core::MigrationSink)
//! - **Incoming**: a single-use listener whose first connection is loaded
//!   through [`VmHost`](core::VmHost)
//! - **Fault tolerance**: on the receiving side, the accepted connection can
//!   be kept open as a transaction channel until the guest starts
//!
//! Everything runs on one thread, driven by
//! [`MigrationSession::run_once`](migration::MigrationSession::run_once).
//!
//! ## Feature Flags
//!
//! - `config-file`: load [`MigrationConfig`] from TOML
//!
//! ## Modules
//!
//! - [`core`]: collaborator traits, constants, and error types
//! - [`transport`]: address parsing, socket adapter, readiness reactor
//! - [`migration`]: the session and its connector, acceptor and
//!   fault-tolerance scheduler
//! - [`config`]: session configuration
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::os::fd::BorrowedFd;
//! use std::time::Duration;
//!
//! use vm_migration_tcp::prelude::*;
//!
//! struct Sink;
//!
//! impl MigrationSink for Sink {
//!     fn on_connected(&mut self, migration: OutgoingMigration) {
//!         println!("connected to {}", migration.peer());
//!     }
//!
//!     fn on_error(&mut self, _migration: OutgoingMigration, error: MigrationError) {
//!         eprintln!("migration failed: {error}");
//!     }
//! }
//!
//! struct Host;
//!
//! impl VmHost for Host {
//!     fn process_incoming(&mut self, _stream: &mut dyn StreamFile) {}
//!     fn disable_autostart(&mut self) {}
//!     fn suspend_monitor(&mut self) {}
//!     fn schedule_replay(&mut self) {}
//! }
//!
//! struct NoStreams;
//!
//! impl StreamFactory for NoStreams {
//!     fn open_socket(&mut self, _conn: BorrowedFd<'_>) -> Option<Box<dyn StreamFile>> {
//!         None
//!     }
//!
//!     fn open_ft_trans(
//!         &mut self,
//!         _listener: BorrowedFd<'_>,
//!         _conn: BorrowedFd<'_>,
//!     ) -> Option<Box<dyn FtChannel>> {
//!         None
//!     }
//! }
//!
//! # fn main() -> Result<(), MigrationError> {
//! let mut session = MigrationSession::new(
//!     MigrationConfig::from_env(),
//!     Box::new(Host),
//!     Box::new(NoStreams),
//!     Box::new(Sink),
//! )?;
//!
//! let handle = session.start_outgoing("192.0.2.10:4444", OutgoingParams::new())?;
//! while !session.is_idle() {
//!     session.run_once(Some(Duration::from_millis(100)))?;
//! }
//! println!("status: {:?}", handle.status());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod migration;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{MigrationConfig, MigrationConfigBuilder};
    pub use crate::core::*;
    pub use crate::migration::{
        FtMode, FtModeCell, ListenerId, MigrationHandle, MigrationSession, MigrationStatus,
        OutgoingMigration, OutgoingParams,
    };
    pub use crate::transport::{ListenerEndpoint, SocketIo, TransportEndpoint, parse_host_port};
}

// Re-export commonly used items at crate root
pub use crate::config::MigrationConfig;
pub use crate::core::{MigrationError, MigrationResult};
pub use crate::migration::{FtMode, MigrationSession, OutgoingParams};
