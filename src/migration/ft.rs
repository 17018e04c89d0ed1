//! Fault-tolerance handshake scheduler.
//!
//! Runs on the receiving side only, after the incoming VM state was loaded
//! while the mode was `Init`:
//!
//! ```text
//! Init ──handshake ok──► TransactionReceiving ──guest runs──► Off
//!   │                            │                             ▲
//!   └──open/handshake fails──►  Error ◄──protocol error──┘     │
//!                                 └─────────guest runs─────────┘
//! ```
//!
//! The channel is registered edge-triggered. It is polled once per
//! readiness and re-armed while unread input remains, so a channel that
//! consumes one unit per poll still drains its socket.

use mio::{Interest, Token};
use tracing::{debug, error, info, instrument, warn};

use super::mode::FtMode;
use super::session::{MigrationSession, Pending};
use crate::core::{FtChannel, MigrationError, StreamFile};
use crate::transport::{ListenerEndpoint, SocketIo, TransportEndpoint};

/// Registration handle for a run-state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunStateToken(u64);

/// What to do when the guest changes run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunStateAction {
    /// Leave fault-tolerant receive once the guest runs.
    FtReset {
        /// Token of the fault-tolerant channel.
        channel: Token,
    },
}

/// Guest run-state handlers.
#[derive(Debug, Default)]
pub struct RunStateRegistry {
    next: u64,
    handlers: Vec<(RunStateToken, RunStateAction)>,
}

impl RunStateRegistry {
    pub(crate) fn register(&mut self, action: RunStateAction) -> RunStateToken {
        let token = RunStateToken(self.next);
        self.next = self.next.wrapping_add(1);
        self.handlers.push((token, action));
        token
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unregister(&mut self, token: RunStateToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    pub(crate) fn take(&mut self) -> Vec<(RunStateToken, RunStateAction)> {
        std::mem::take(&mut self.handlers)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Live fault-tolerant channel: the transport plus both sockets it runs on.
pub(crate) struct FtSession {
    listener: ListenerEndpoint,
    conn: TransportEndpoint,
    channel: Box<dyn FtChannel>,
}

impl std::fmt::Debug for FtSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtSession")
            .field("listener", &self.listener)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl MigrationSession {
    /// Take over the listening and accepted sockets for the fault-tolerant
    /// channel. Called with the mode in `Init`.
    pub(super) fn begin_fault_tolerance(
        &mut self,
        listener: ListenerEndpoint,
        conn: TransportEndpoint,
    ) {
        if let Err(e) = conn.set_nodelay(true) {
            warn!(error = %e, "could not set TCP_NODELAY on fault-tolerant channel");
        }

        let channel = match (listener.as_fd(), conn.as_fd()) {
            (Some(l), Some(c)) => self.streams.open_ft_trans(l, c),
            _ => None,
        };
        let Some(mut channel) = channel else {
            error!("could not open fault-tolerant transport");
            self.abandon_incoming(listener, conn, MigrationError::FtOpen);
            return;
        };

        // Waits for the sender to set up its side.
        if let Err(errno) = channel.begin() {
            error!(%errno, "fault-tolerant handshake failed");
            self.ft_mode.advance(FtMode::Error);
            channel.close();
            self.abandon_incoming(listener, conn, MigrationError::FtHandshake(errno));
            return;
        }

        let token = self.reactor.next_token();
        let registered = match conn.raw_fd() {
            Some(fd) => self
                .reactor
                .register(fd, token, Interest::READABLE)
                .map_err(MigrationError::from),
            None => Err(MigrationError::FtOpen),
        };
        if let Err(err) = registered {
            self.ft_mode.advance(FtMode::Error);
            channel.close();
            self.abandon_incoming(listener, conn, err);
            return;
        }

        self.host.schedule_replay();
        let handler = self
            .run_state
            .register(RunStateAction::FtReset { channel: token });
        self.ft_mode.advance(FtMode::TransactionReceiving);

        info!(token = token.0, handler = handler.0, "fault-tolerant channel established");
        self.pending.insert(
            token,
            Pending::FtReceive(FtSession {
                listener,
                conn,
                channel,
            }),
        );
    }

    /// Read readiness on the fault-tolerant channel.
    pub(super) fn on_ft_readable(&mut self, token: Token, mut session: FtSession) {
        session.channel.poll_notifications();

        if !session.channel.has_error() {
            if session.conn.has_pending_input() {
                if let Some(fd) = session.conn.raw_fd() {
                    if let Err(e) = self.reactor.rearm(fd, token, Interest::READABLE) {
                        warn!(token = token.0, error = %e, "could not re-arm fault-tolerant channel");
                    }
                }
            }
            self.pending.insert(token, Pending::FtReceive(session));
            return;
        }

        warn!(token = token.0, "fault-tolerant channel reported an error");
        self.ft_mode.advance(FtMode::Error);
        self.close_ft_session(session);
        self.host.on_incoming_error(&MigrationError::FtProtocol);
    }

    fn close_ft_session(&mut self, mut session: FtSession) {
        if let Some(fd) = session.conn.raw_fd() {
            self.reactor.deregister(fd);
        }
        session.channel.close();
        session.conn.close();
        session.listener.close();
    }

    /// Notify the session of a guest run-state change.
    ///
    /// On a transition to running every handler fires once and is removed.
    /// Fault-tolerant receive ends: a live channel is closed and the mode
    /// goes to `Off`, also from `Error`.
    #[instrument(skip(self))]
    pub fn vm_state_changed(&mut self, running: bool) {
        if !running {
            return;
        }

        for (handler, action) in self.run_state.take() {
            match action {
                RunStateAction::FtReset { channel } => {
                    match self.pending.remove(&channel) {
                        Some(Pending::FtReceive(session)) => self.close_ft_session(session),
                        Some(other) => {
                            self.pending.insert(channel, other);
                        }
                        None => {}
                    }
                    self.ft_mode.advance(FtMode::Off);
                    debug!(handler = handler.0, "fault-tolerant replay hook removed");
                }
            }
        }
    }

    /// Guest run-state handlers currently registered.
    pub fn run_state_handlers(&self) -> &RunStateRegistry {
        &self.run_state
    }

    /// Check if a fault-tolerant channel is live.
    pub fn has_ft_channel(&self) -> bool {
        self.pending
            .values()
            .any(|p| matches!(p, Pending::FtReceive(_)))
    }
}
