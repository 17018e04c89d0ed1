//! Migration session: the reactor plus every step waiting on it.
//!
//! Each pending step is keyed by its reactor token. Dispatch removes the
//! step from the table and hands it to its handler by value; a handler
//! that needs to keep waiting puts it back.

use std::collections::HashMap;
use std::time::Duration;

use mio::Token;
use tracing::{debug, trace};

use super::ft::{FtSession, RunStateRegistry};
use super::incoming::IncomingListener;
use super::mode::FtModeCell;
use super::outgoing::OutgoingMigration;
use crate::config::MigrationConfig;
use crate::core::{MigrationResult, MigrationSink, StreamFactory, VmHost};
use crate::transport::{ConnectOps, Reactor, SystemConnect};

/// A step waiting for readiness.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Outgoing connect in progress (write readiness).
    Connect(OutgoingMigration),
    /// Listener waiting for its connection (read readiness).
    Accept(IncomingListener),
    /// Fault-tolerant channel in transaction receive (read readiness).
    FtReceive(FtSession),
}

/// Single-threaded driver for outgoing and incoming migration setup.
///
/// Not `Send`: the fault-tolerance mode is shared with the endpoints the
/// session creates.
pub struct MigrationSession {
    pub(super) reactor: Reactor,
    pub(super) pending: HashMap<Token, Pending>,
    pub(super) run_state: RunStateRegistry,
    pub(super) ft_mode: FtModeCell,
    pub(super) config: MigrationConfig,
    pub(super) host: Box<dyn VmHost>,
    pub(super) streams: Box<dyn StreamFactory>,
    pub(super) sink: Box<dyn MigrationSink>,
    pub(super) connector: Box<dyn ConnectOps>,
}

impl MigrationSession {
    /// Create a session.
    pub fn new(
        config: MigrationConfig,
        host: Box<dyn VmHost>,
        streams: Box<dyn StreamFactory>,
        sink: Box<dyn MigrationSink>,
    ) -> MigrationResult<Self> {
        config.validate()?;
        let reactor = Reactor::new(config.poll_capacity)?;

        debug!(?config, "migration session created");
        Ok(Self {
            reactor,
            pending: HashMap::new(),
            run_state: RunStateRegistry::default(),
            ft_mode: FtModeCell::new(),
            config,
            host,
            streams,
            sink,
            connector: Box::new(SystemConnect),
        })
    }

    /// Replace how outgoing sockets issue `connect` and read `SO_ERROR`.
    pub fn set_connector(&mut self, connector: Box<dyn ConnectOps>) {
        self.connector = connector;
    }

    /// Session configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The fault-tolerance mode shared with this session's endpoints.
    pub fn ft_mode(&self) -> &FtModeCell {
        &self.ft_mode
    }

    /// Check if nothing is waiting for readiness.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of steps waiting for readiness.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait up to `timeout` for readiness and run the handlers that became
    /// ready. Returns how many ran.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> MigrationResult<usize> {
        let ready = self.reactor.poll(timeout)?;

        let mut dispatched = 0;
        for readiness in ready {
            // An earlier handler in this batch may have retired the token.
            let Some(step) = self.pending.remove(&readiness.token) else {
                trace!(token = readiness.token.0, "readiness for retired token");
                continue;
            };

            if readiness.error {
                debug!(token = readiness.token.0, "error or hang-up reported");
            }
            trace!(?readiness, "dispatch");
            dispatched += 1;
            match step {
                Pending::Connect(migration) => self.on_connect_ready(readiness.token, migration),
                Pending::Accept(incoming) => self.on_accept_ready(readiness.token, incoming),
                Pending::FtReceive(session) => self.on_ft_readable(readiness.token, session),
            }
        }
        Ok(dispatched)
    }
}

impl std::fmt::Debug for MigrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSession")
            .field("ft_mode", &self.ft_mode.get())
            .field("pending", &self.pending.len())
            .field("run_state", &self.run_state.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
