//! Incoming acceptor.
//!
//! Owns a single-use listener. The first accepted connection is handed to
//! the host for loading; the listener never accepts a second one.

use std::io;
use std::net::SocketAddr;

use mio::{Interest, Token};
use tracing::{debug, error, info, instrument, warn};

use super::session::{MigrationSession, Pending};
use crate::core::{MigrationError, MigrationResult, errno_of, status_of};
use crate::transport::{ListenerEndpoint, SocketIo, TransportEndpoint, parse_host_port};

/// Identifies a listener started by [`MigrationSession::start_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Token);

/// A listener waiting for its one connection.
#[derive(Debug)]
pub(crate) struct IncomingListener {
    listener: ListenerEndpoint,
    addr: SocketAddr,
}

impl MigrationSession {
    /// Listen on `address` (`host:port`) for one incoming migration.
    ///
    /// When the session is configured for fault tolerance the mode is
    /// armed (`Init`) before the listener is created.
    #[instrument(skip(self))]
    pub fn start_incoming(&mut self, address: &str) -> MigrationResult<ListenerId> {
        let addr = parse_host_port(address).inspect_err(|e| {
            error!(address, error = %e, "invalid host/port combination");
        })?;

        if self.config.fault_tolerant && !self.ft_mode.enable() {
            return Err(MigrationError::Config(format!(
                "fault-tolerant receive already in {} mode",
                self.ft_mode.get()
            )));
        }

        let (listener, token) = self.listen(&addr).inspect_err(|_| {
            // An armed attempt that never got a listener can't bootstrap.
            if self.ft_mode.is_init() {
                self.ft_mode.advance(super::FtMode::Error);
            }
        })?;

        let addr = listener.local_addr().unwrap_or(addr);
        info!(%addr, ft_mode = %self.ft_mode.get(), "waiting for incoming migration");
        self.pending
            .insert(token, Pending::Accept(IncomingListener { listener, addr }));
        Ok(ListenerId(token))
    }

    fn listen(&mut self, addr: &SocketAddr) -> MigrationResult<(ListenerEndpoint, Token)> {
        let mut listener = ListenerEndpoint::bind(addr)?;
        let Some(fd) = listener.raw_fd() else {
            return Err(MigrationError::Socket(nix::errno::Errno::EBADF));
        };

        let token = self.reactor.next_token();
        if let Err(e) = self.reactor.register(fd, token, Interest::READABLE) {
            listener.close();
            return Err(e.into());
        }
        Ok((listener, token))
    }

    /// [`start_incoming`](Self::start_incoming) collapsed to `0 | -errno`.
    pub fn start_incoming_status(&mut self, address: &str) -> i32 {
        status_of(&self.start_incoming(address))
    }

    /// Bound address of a listener that is still waiting.
    pub fn listener_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        match self.pending.get(&id.0) {
            Some(Pending::Accept(incoming)) => Some(incoming.addr),
            _ => None,
        }
    }

    /// Tear down a listener that is still waiting.
    pub fn cancel_incoming(&mut self, id: ListenerId) -> bool {
        match self.pending.remove(&id.0) {
            Some(Pending::Accept(mut incoming)) => {
                self.close_listener(&mut incoming.listener);
                info!(addr = %incoming.addr, "incoming migration cancelled");
                true
            }
            Some(other) => {
                self.pending.insert(id.0, other);
                false
            }
            None => false,
        }
    }

    /// A connection is waiting on the listener.
    pub(super) fn on_accept_ready(&mut self, token: Token, mut incoming: IncomingListener) {
        let (socket, peer) = match incoming.listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(token = token.0, "spurious accept readiness");
                self.pending.insert(token, Pending::Accept(incoming));
                return;
            }
            Err(e) => {
                let err = MigrationError::Accept(errno_of(&e));
                error!(addr = %incoming.addr, error = %err, "could not accept migration connection");
                if self.ft_mode.is_init() {
                    self.ft_mode.advance(super::FtMode::Error);
                }
                self.close_listener(&mut incoming.listener);
                self.host.on_incoming_error(&err);
                return;
            }
        };

        // Single use: no further accepts on this listener.
        if let Some(fd) = incoming.listener.raw_fd() {
            self.reactor.deregister(fd);
        }
        info!(peer = ?peer, "accepted migration");

        let mut conn = TransportEndpoint::from_socket(socket, self.ft_mode.clone());
        let stream = conn.as_fd().and_then(|fd| self.streams.open_socket(fd));
        let Some(mut stream) = stream else {
            error!("could not open stream over migration socket");
            self.abandon_incoming(incoming.listener, conn, MigrationError::StreamOpen);
            return;
        };

        if self.ft_mode.is_init() {
            self.host.disable_autostart();
        }

        self.host.process_incoming(stream.as_mut());

        if self.ft_mode.is_init() {
            // The stream wrapper goes away without closing anything; the
            // fault-tolerant channel takes over the same descriptor.
            drop(stream);
            self.begin_fault_tolerance(incoming.listener, conn);
            return;
        }

        stream.close();
        conn.close();
        incoming.listener.close();
        debug!("incoming migration handed off");
    }

    /// Close everything an incoming attempt holds and report `error`.
    ///
    /// An attempt that was bootstrapping fault tolerance ends in `Error`
    /// first, otherwise the accepted socket could not be closed.
    pub(super) fn abandon_incoming(
        &mut self,
        mut listener: ListenerEndpoint,
        mut conn: TransportEndpoint,
        error: MigrationError,
    ) {
        if self.ft_mode.is_init() {
            self.ft_mode.advance(super::FtMode::Error);
        }
        conn.close();
        listener.close();
        warn!(%error, "incoming migration failed");
        self.host.on_incoming_error(&error);
    }

    fn close_listener(&mut self, listener: &mut ListenerEndpoint) {
        if let Some(fd) = listener.raw_fd() {
            self.reactor.deregister(fd);
        }
        listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::test_support::{Recorded, TestHarness};
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn test_invalid_address_fails_without_listener() {
        let mut harness = TestHarness::new();
        let status = harness.session.start_incoming_status("host-without-port");
        assert_eq!(status, -(nix::errno::Errno::EINVAL as i32));
        assert!(harness.session.is_idle());
    }

    #[test]
    fn test_unbindable_address_fails_without_listener() {
        let mut harness = TestHarness::new();
        let err = harness.session.start_incoming("192.0.2.1:0").unwrap_err();
        assert!(err.status() < 0);
        assert!(matches!(err, MigrationError::Bind(_)));
        assert!(harness.session.is_idle());
    }

    #[test]
    fn test_accepts_exactly_one_connection() {
        let mut harness = TestHarness::new();
        let id = harness.session.start_incoming("127.0.0.1:0").unwrap();
        let addr = harness.session.listener_addr(id).unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"QEVM").unwrap();
        harness.run_until(|log| log.processed_incoming > 0);

        {
            let log = harness.log.borrow();
            assert_eq!(log.processed_incoming, 1);
            assert_eq!(log.stream_closes, 1);
            assert_eq!(log.autostart_disabled, 0);
            assert!(log.incoming_errors.is_empty());
        }
        assert!(harness.session.is_idle());
        assert!(harness.session.listener_addr(id).is_none());

        // The listener is gone; a second attempt is refused.
        assert!(TcpStream::connect(addr).is_err());
        harness.run_for(3);
        assert_eq!(harness.log.borrow().processed_incoming, 1);
    }

    #[test]
    fn test_address_reuse_after_previous_attempt() {
        let mut harness = TestHarness::new();
        let id = harness.session.start_incoming("127.0.0.1:0").unwrap();
        let addr = harness.session.listener_addr(id).unwrap();

        let client = TcpStream::connect(addr).unwrap();
        harness.run_until(|log| log.processed_incoming > 0);
        drop(client);

        // The previous connection may linger in TIME_WAIT.
        let again = harness.session.start_incoming(&addr.to_string()).unwrap();
        assert_eq!(harness.session.listener_addr(again), Some(addr));
    }

    #[test]
    fn test_stream_open_failure_is_reported() {
        let mut harness = TestHarness::new();
        harness.log.borrow_mut().refuse_stream = true;
        let id = harness.session.start_incoming("127.0.0.1:0").unwrap();
        let addr = harness.session.listener_addr(id).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        harness.run_until(|log| !log.incoming_errors.is_empty());

        let log = harness.log.borrow();
        assert_eq!(log.processed_incoming, 0);
        assert_eq!(log.events, vec![Recorded::IncomingError(nix::errno::Errno::ENOMEM)]);
        drop(log);
        assert!(harness.session.is_idle());
    }

    #[test]
    fn test_cancel_incoming() {
        let mut harness = TestHarness::new();
        let id = harness.session.start_incoming("127.0.0.1:0").unwrap();
        let addr = harness.session.listener_addr(id).unwrap();

        assert!(harness.session.cancel_incoming(id));
        assert!(!harness.session.cancel_incoming(id));
        assert!(harness.session.is_idle());
        assert!(TcpStream::connect(addr).is_err());
    }
}
