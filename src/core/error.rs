//! Error types for the migration transport.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur when parsing a `host:port` address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// No `:port` suffix.
    #[error("missing port in {0:?}")]
    MissingPort(String),

    /// Port is not a number in range.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// Host name did not resolve to any address.
    #[error("unknown host {0:?}")]
    UnknownHost(String),
}

/// Top-level migration transport errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Address text could not be parsed.
    #[error("invalid host/port combination: {0}")]
    Address(#[from] AddressError),

    /// Socket creation or setup failed.
    #[error("socket creation failed: {0}")]
    Socket(Errno),

    /// Outgoing connect failed (synchronously or via `SO_ERROR`).
    #[error("connect failed: {0}")]
    Connect(Errno),

    /// Binding the listener failed.
    #[error("bind failed: {0}")]
    Bind(Errno),

    /// Listening failed.
    #[error("listen failed: {0}")]
    Listen(Errno),

    /// Accepting the inbound connection failed.
    #[error("could not accept migration connection: {0}")]
    Accept(Errno),

    /// The byte-stream wrapper could not be opened over the accepted socket.
    #[error("could not open stream over accepted socket")]
    StreamOpen,

    /// The fault-tolerant transport could not be opened.
    #[error("could not open fault-tolerant transport")]
    FtOpen,

    /// The fault-tolerant begin handshake failed.
    #[error("fault-tolerant handshake failed: {0}")]
    FtHandshake(Errno),

    /// The fault-tolerant channel reported a protocol error.
    #[error("fault-tolerant protocol error")]
    FtProtocol,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (event loop registration and polling).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl MigrationError {
    /// Platform error code this error reports through the signed status
    /// contract.
    pub fn errno(&self) -> Errno {
        match self {
            MigrationError::Address(_) | MigrationError::Config(_) => Errno::EINVAL,
            MigrationError::Socket(e)
            | MigrationError::Connect(e)
            | MigrationError::Bind(e)
            | MigrationError::Listen(e)
            | MigrationError::Accept(e)
            | MigrationError::FtHandshake(e) => *e,
            MigrationError::StreamOpen | MigrationError::FtOpen => Errno::ENOMEM,
            MigrationError::FtProtocol => Errno::EPROTO,
            MigrationError::Io(e) => errno_of(e),
        }
    }

    /// Negative errno, as returned by the `0 | -errno` entry points.
    pub fn status(&self) -> i32 {
        -(self.errno() as i32)
    }
}

/// Extract the platform error code from an I/O error.
///
/// Errors that carry no OS code (synthetic ones) map to `EIO`.
pub fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Result type for migration transport operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Collapse a result into the `0 | -errno` status contract.
pub fn status_of<T>(result: &MigrationResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}
