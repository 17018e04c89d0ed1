//! Outgoing connector.
//!
//! Opens a non-blocking socket, issues `connect`, and either hands the
//! connected socket to the [`MigrationSink`](crate::core::MigrationSink)
//! right away or waits for writability.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::{Interest, Token};
use nix::errno::Errno;
use socket2::SockAddr;
use tracing::{debug, info, instrument, warn};

use super::session::{MigrationSession, Pending};
use crate::core::{MigrationError, MigrationResult, errno_of};
use crate::transport::{SocketIo, TransportEndpoint, parse_host_port};

/// Status of an outgoing migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationStatus {
    /// Connecting or streaming.
    #[default]
    Active,
    /// The state machine finished the transfer.
    Completed,
    /// The attempt failed.
    Error,
    /// The attempt was cancelled.
    Cancelled,
}

/// Status shared between an attempt and its handle.
#[derive(Debug, Clone, Default)]
struct StatusCell(Rc<Cell<MigrationStatus>>);

impl StatusCell {
    fn get(&self) -> MigrationStatus {
        self.0.get()
    }

    fn set(&self, status: MigrationStatus) {
        self.0.set(status);
    }
}

/// Parameters of an outgoing attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutgoingParams {
    /// Bandwidth limit in bytes per second (`None` = configured default).
    pub bandwidth_limit: Option<u64>,
    /// Don't suspend the monitor for the duration of the attempt.
    pub detach: bool,
    /// Migrate block devices too.
    pub disk_only: bool,
    /// Block migration over incrementally shared storage.
    pub incremental_shared_storage: bool,
}

impl OutgoingParams {
    /// Create parameters with defaults (attached, no block migration).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bandwidth limit.
    pub fn bandwidth_limit(mut self, limit: u64) -> Self {
        self.bandwidth_limit = Some(limit);
        self
    }

    /// Run detached from the monitor.
    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Enable block migration.
    pub fn disk_only(mut self, enabled: bool) -> Self {
        self.disk_only = enabled;
        self
    }

    /// Enable incremental block migration over shared storage.
    pub fn incremental_shared_storage(mut self, enabled: bool) -> Self {
        self.incremental_shared_storage = enabled;
        self
    }
}

/// One outgoing attempt, owned by whoever drives it next.
#[derive(Debug)]
pub struct OutgoingMigration {
    endpoint: TransportEndpoint,
    peer: SocketAddr,
    bandwidth_limit: u64,
    disk_only: bool,
    incremental_shared_storage: bool,
    status: StatusCell,
}

impl OutgoingMigration {
    fn new(endpoint: TransportEndpoint, peer: SocketAddr, params: OutgoingParams, default_limit: u64) -> Self {
        Self {
            endpoint,
            peer,
            bandwidth_limit: params.bandwidth_limit.unwrap_or(default_limit),
            disk_only: params.disk_only,
            incremental_shared_storage: params.incremental_shared_storage,
            status: StatusCell::default(),
        }
    }

    /// The migration socket.
    pub fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    /// The migration socket, for reading and writing.
    pub fn endpoint_mut(&mut self) -> &mut TransportEndpoint {
        &mut self.endpoint
    }

    /// Give up the attempt and keep the socket.
    pub fn into_endpoint(self) -> TransportEndpoint {
        self.endpoint
    }

    /// Destination address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bandwidth limit in bytes per second.
    pub fn bandwidth_limit(&self) -> u64 {
        self.bandwidth_limit
    }

    /// Whether block devices are migrated.
    pub fn disk_only(&self) -> bool {
        self.disk_only
    }

    /// Whether block migration is incremental over shared storage.
    pub fn incremental_shared_storage(&self) -> bool {
        self.incremental_shared_storage
    }

    /// Current status.
    pub fn status(&self) -> MigrationStatus {
        self.status.get()
    }

    /// Update the status (visible through the handle).
    pub fn set_status(&mut self, status: MigrationStatus) {
        self.status.set(status);
    }
}

/// Handle returned to the caller of
/// [`MigrationSession::start_outgoing`].
#[derive(Debug, Clone)]
pub struct MigrationHandle {
    token: Token,
    status: StatusCell,
}

impl MigrationHandle {
    /// Current status of the attempt.
    pub fn status(&self) -> MigrationStatus {
        self.status.get()
    }

    /// Check if the attempt is still active.
    pub fn is_active(&self) -> bool {
        self.status() == MigrationStatus::Active
    }
}

/// How a single `connect` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Connected immediately.
    Connected,
    /// Completion will be signalled by writability.
    InProgress,
    /// Interrupted; issue the call again.
    Interrupted,
    /// Failed for good.
    Failed(Errno),
}

/// Classify the result of a non-blocking `connect`.
pub fn classify_connect(result: &io::Result<()>) -> ConnectOutcome {
    let err = match result {
        Ok(()) => return ConnectOutcome::Connected,
        Err(e) => e,
    };
    match errno_of(err) {
        Errno::EINTR => ConnectOutcome::Interrupted,
        Errno::EINPROGRESS | Errno::EAGAIN | Errno::EALREADY => ConnectOutcome::InProgress,
        errno => ConnectOutcome::Failed(errno),
    }
}

impl MigrationSession {
    /// Start an outgoing migration to `address` (`host:port`).
    ///
    /// Address and socket errors are returned synchronously. Connection
    /// errors are reported to the sink; the returned handle then already
    /// shows [`MigrationStatus::Error`].
    #[instrument(skip(self, params))]
    pub fn start_outgoing(
        &mut self,
        address: &str,
        params: OutgoingParams,
    ) -> MigrationResult<MigrationHandle> {
        let peer = parse_host_port(address)?;
        let endpoint = TransportEndpoint::open_stream(&peer, self.ft_mode.clone())
            .map_err(|e| MigrationError::Socket(errno_of(&e)))?;

        let token = self.reactor.next_token();
        let migration = OutgoingMigration::new(
            endpoint,
            peer,
            params,
            self.config.default_bandwidth_limit,
        );
        let handle = MigrationHandle {
            token,
            status: migration.status.clone(),
        };
        debug!(
            %peer,
            bandwidth_limit = migration.bandwidth_limit,
            disk_only = migration.disk_only,
            incremental = migration.incremental_shared_storage,
            "starting outgoing migration"
        );

        if !params.detach {
            self.host.suspend_monitor();
        }

        self.connect_outgoing(token, migration);
        Ok(handle)
    }

    fn connect_outgoing(&mut self, token: Token, migration: OutgoingMigration) {
        let target = SockAddr::from(migration.peer);
        loop {
            let result = self.connector.connect(&migration.endpoint, &target);
            match classify_connect(&result) {
                ConnectOutcome::Interrupted => continue,
                ConnectOutcome::Connected => {
                    info!(peer = %migration.peer, "connected");
                    self.sink.on_connected(migration);
                }
                ConnectOutcome::InProgress => {
                    let Some(fd) = migration.endpoint.raw_fd() else {
                        self.fail_outgoing(migration, MigrationError::Connect(Errno::EBADF));
                        return;
                    };
                    if let Err(e) = self.reactor.register(fd, token, Interest::WRITABLE) {
                        self.fail_outgoing(migration, MigrationError::Io(e));
                        return;
                    }
                    debug!(token = token.0, "connect in progress");
                    self.pending.insert(token, Pending::Connect(migration));
                }
                ConnectOutcome::Failed(errno) => {
                    self.fail_outgoing(migration, MigrationError::Connect(errno));
                }
            }
            return;
        }
    }

    /// Writability on a pending connect: the handshake finished one way or
    /// the other.
    pub(super) fn on_connect_ready(&mut self, token: Token, migration: OutgoingMigration) {
        if let Some(fd) = migration.endpoint.raw_fd() {
            self.reactor.deregister(fd);
        }

        match self.connector.take_error(&migration.endpoint) {
            Ok(None) => {
                info!(token = token.0, peer = %migration.peer, "connect completed");
                self.sink.on_connected(migration);
            }
            Ok(Some(e)) | Err(e) => {
                debug!(token = token.0, error = %e, "error connecting");
                self.fail_outgoing(migration, MigrationError::Connect(errno_of(&e)));
            }
        }
    }

    fn fail_outgoing(&mut self, mut migration: OutgoingMigration, error: MigrationError) {
        warn!(peer = %migration.peer, %error, "outgoing migration failed");
        migration.endpoint.close();
        migration.set_status(MigrationStatus::Error);
        self.sink.on_error(migration, error);
    }

    /// Cancel an attempt.
    ///
    /// A still-pending connect is deregistered and closed. An attempt that
    /// was already handed over is only marked cancelled; its owner sees
    /// the status. Returns `false` if the attempt was no longer active.
    pub fn cancel(&mut self, handle: &MigrationHandle) -> bool {
        match self.pending.remove(&handle.token) {
            Some(Pending::Connect(mut migration)) => {
                if let Some(fd) = migration.endpoint.raw_fd() {
                    self.reactor.deregister(fd);
                }
                migration.endpoint.close();
                migration.set_status(MigrationStatus::Cancelled);
                info!(token = handle.token.0, "pending outgoing migration cancelled");
                true
            }
            Some(other) => {
                self.pending.insert(handle.token, other);
                false
            }
            None if handle.is_active() => {
                handle.status.set(MigrationStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Give up a handle.
    ///
    /// An attempt that is still active is cancelled first, exactly as by
    /// [`cancel`](Self::cancel).
    pub fn release(&mut self, handle: MigrationHandle) {
        if handle.is_active() {
            self.cancel(&handle);
        }
        debug!(token = handle.token.0, status = ?handle.status(), "migration handle released");
    }
}
