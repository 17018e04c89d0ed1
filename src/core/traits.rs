//! Collaborator traits.
//!
//! The transport layer only establishes connections. Everything that
//! happens on the wire afterwards, and every host-side reaction, lives
//! behind these traits.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;

use super::error::MigrationError;
use crate::migration::OutgoingMigration;

/// Receives outgoing attempts once their connection is settled.
///
/// Exactly one of `on_connected` or `on_error` is called per attempt,
/// and ownership of the attempt moves with the call.
pub trait MigrationSink {
    /// The socket is connected; the state machine now owns it.
    fn on_connected(&mut self, migration: OutgoingMigration);

    /// The attempt failed. The endpoint has already been closed (unless
    /// fault-tolerant bootstrap forbids it) and the status is `Error`.
    fn on_error(&mut self, migration: OutgoingMigration, error: MigrationError);
}

/// Byte-stream wrapper opened over a socket.
///
/// The wrapper never owns the descriptor it was opened over: `close`
/// releases the wrapper only, and the transport closes the socket.
pub trait StreamFile {
    /// Release the wrapper. Returns 0 or a negative errno.
    fn close(&mut self) -> i32;

    /// Check whether a previous operation failed.
    fn has_error(&self) -> bool;

    /// Process whatever protocol notifications are pending.
    ///
    /// Called once per read-readiness of the underlying socket. The socket
    /// is re-armed while unread input remains, so an implementation may
    /// consume as little as one unit per call.
    fn poll_notifications(&mut self);
}

/// Fault-tolerant transaction transport.
pub trait FtChannel: StreamFile {
    /// Run the begin handshake with the sender.
    fn begin(&mut self) -> Result<(), Errno>;
}

/// Opens wrappers over descriptors owned by the transport.
pub trait StreamFactory {
    /// Open a byte stream over an accepted socket.
    fn open_socket(&mut self, conn: BorrowedFd<'_>) -> Option<Box<dyn StreamFile>>;

    /// Open the fault-tolerant transport over the listening and accepted
    /// sockets.
    fn open_ft_trans(
        &mut self,
        listener: BorrowedFd<'_>,
        conn: BorrowedFd<'_>,
    ) -> Option<Box<dyn FtChannel>>;
}

/// Host-side hooks of the hypervisor.
pub trait VmHost {
    /// Load the incoming VM state from the stream.
    fn process_incoming(&mut self, stream: &mut dyn StreamFile);

    /// Keep the guest stopped after the incoming load.
    fn disable_autostart(&mut self);

    /// Suspend the interactive monitor while an attached migration runs.
    fn suspend_monitor(&mut self);

    /// Arm the periodic replay of buffered fault-tolerant transactions.
    fn schedule_replay(&mut self);

    /// An incoming attempt failed after setup returned.
    fn on_incoming_error(&mut self, error: &MigrationError) {
        let _ = error;
    }
}
