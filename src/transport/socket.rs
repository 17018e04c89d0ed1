//! Socket I/O adapter.
//!
//! Thin wrappers around send/recv/getsockopt/close that fold interrupted
//! calls and platform errors into one signed contract: a non-negative
//! value is a byte count, a negative value is `-errno`.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::core::{LISTEN_BACKLOG, MigrationError, MigrationResult, errno_of};
use crate::migration::{FtMode, FtModeCell};

/// Capability set bound onto a migration endpoint.
///
/// Only [`TransportEndpoint`] implements it in this crate; the trait exists
/// so the migration state machine can run against a fake.
pub trait SocketIo {
    /// Send once. Partial writes are the caller's to resubmit.
    fn write(&mut self, buf: &[u8]) -> isize;

    /// Receive, retrying interrupted calls.
    fn read(&mut self, buf: &mut [u8]) -> isize;

    /// Platform error code of the last failed call.
    fn query_error(&self) -> i32;

    /// Close the descriptor. Always returns 0.
    fn close(&mut self) -> i32;
}

/// Run a syscall wrapper until it stops failing with `EINTR`.
pub fn retry_on_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Fold an I/O result into the signed byte-count contract.
pub fn io_status(result: io::Result<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => -(errno_of(&e) as i32 as isize),
    }
}

fn closed_error() -> io::Error {
    io::Error::from_raw_os_error(Errno::EBADF as i32)
}

/// One migration-owned stream socket.
///
/// The descriptor is either open or `None`; the session guarantees that
/// an open descriptor is registered with at most one pending step and that
/// it is deregistered before it is closed.
#[derive(Debug)]
pub struct TransportEndpoint {
    /// The socket, `None` once closed.
    socket: Option<Socket>,
    /// Shared fault-tolerance mode (gates `close`).
    ft_mode: FtModeCell,
}

impl TransportEndpoint {
    /// Create an endpoint with no descriptor.
    pub fn closed(ft_mode: FtModeCell) -> Self {
        Self {
            socket: None,
            ft_mode,
        }
    }

    /// Wrap an existing socket.
    pub fn from_socket(socket: Socket, ft_mode: FtModeCell) -> Self {
        Self {
            socket: Some(socket),
            ft_mode,
        }
    }

    /// Open a non-blocking stream socket suitable for connecting to `addr`.
    pub fn open_stream(addr: &SocketAddr, ft_mode: FtModeCell) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_socket(socket, ft_mode))
    }

    /// Issue one `connect` call.
    pub fn connect(&self, addr: &SockAddr) -> io::Result<()> {
        self.socket.as_ref().ok_or_else(closed_error)?.connect(addr)
    }

    /// Read and clear `SO_ERROR`, retrying interrupted calls.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let socket = self.socket.as_ref().ok_or_else(closed_error)?;
        retry_on_eintr(|| socket.take_error())
    }

    /// Toggle `TCP_NODELAY`.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.socket
            .as_ref()
            .ok_or_else(closed_error)?
            .set_nodelay(nodelay)
    }

    /// Remote address, if connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Raw descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Borrow the descriptor, `None` once closed.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(AsFd::as_fd)
    }

    /// Check if the descriptor has been closed.
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Check for unread input without consuming or waiting for it.
    ///
    /// End of stream and errors count as no input.
    pub fn has_pending_input(&self) -> bool {
        let Some(fd) = self.raw_fd() else {
            return false;
        };
        let mut byte = [0u8; 1];
        loop {
            match recv(fd, &mut byte, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT) {
                Ok(n) => return n > 0,
                Err(Errno::EINTR) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// The two calls of a non-blocking connect.
///
/// The session drives outgoing attempts through this seam; [`SystemConnect`]
/// issues the real syscalls.
pub trait ConnectOps {
    /// Issue one `connect` call on `endpoint`.
    fn connect(&mut self, endpoint: &TransportEndpoint, addr: &SockAddr) -> io::Result<()>;

    /// Read and clear the pending socket error of `endpoint`.
    fn take_error(&mut self, endpoint: &TransportEndpoint) -> io::Result<Option<io::Error>>;
}

/// [`ConnectOps`] backed by the socket itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnect;

impl ConnectOps for SystemConnect {
    fn connect(&mut self, endpoint: &TransportEndpoint, addr: &SockAddr) -> io::Result<()> {
        endpoint.connect(addr)
    }

    fn take_error(&mut self, endpoint: &TransportEndpoint) -> io::Result<Option<io::Error>> {
        endpoint.take_error()
    }
}

impl SocketIo for TransportEndpoint {
    fn write(&mut self, buf: &[u8]) -> isize {
        match self.socket.as_ref() {
            Some(socket) => io_status(socket.send(buf)),
            None => -(Errno::EBADF as i32 as isize),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> isize {
        match self.socket.as_mut() {
            Some(socket) => io_status(retry_on_eintr(|| socket.read(buf))),
            None => -(Errno::EBADF as i32 as isize),
        }
    }

    fn query_error(&self) -> i32 {
        Errno::last() as i32
    }

    fn close(&mut self) -> i32 {
        // The fault-tolerant handshake still needs the socket while
        // bootstrapping.
        if self.ft_mode.get() == FtMode::Init {
            debug!(fd = ?self.raw_fd(), "close deferred during fault-tolerant bootstrap");
            return 0;
        }
        if let Some(socket) = self.socket.take() {
            debug!(fd = socket.as_raw_fd(), "closing migration socket");
            drop(socket);
        }
        0
    }
}

/// Bound, listening socket awaiting exactly one inbound connection.
#[derive(Debug)]
pub struct ListenerEndpoint {
    /// The listening socket, `None` once closed.
    socket: Option<Socket>,
}

impl ListenerEndpoint {
    /// Bind and listen on `addr` with address reuse and a backlog of one.
    pub fn bind(addr: &SocketAddr) -> MigrationResult<Self> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)
            .map_err(|e| MigrationError::Socket(errno_of(&e)))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!(%addr, error = %e, "could not enable address reuse");
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| MigrationError::Socket(errno_of(&e)))?;
        socket
            .bind(&SockAddr::from(*addr))
            .map_err(|e| MigrationError::Bind(errno_of(&e)))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| MigrationError::Listen(errno_of(&e)))?;

        Ok(Self {
            socket: Some(socket),
        })
    }

    /// Accept one pending connection, retrying interrupted calls.
    pub fn accept(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let socket = self.socket.as_ref().ok_or_else(closed_error)?;
        let (conn, peer) = retry_on_eintr(|| socket.accept())?;
        Ok((conn, peer.as_socket()))
    }

    /// Bound address, if still open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Raw descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Borrow the descriptor, `None` once closed.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(AsFd::as_fd)
    }

    /// Close the listening socket. A no-op once closed.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(fd = socket.as_raw_fd(), "closing migration listener");
        }
    }

    /// Check if the listener has been closed.
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}
