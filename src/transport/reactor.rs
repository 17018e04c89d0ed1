//! Readiness reactor.
//!
//! Wraps a `mio::Poll` and hands out tokens. Readiness is reported as a
//! plain list so the session can take ownership of each pending step
//! while it dispatches.
//!
//! `mio` is edge-triggered. A handler that leaves input unread re-arms its
//! descriptor with [`Reactor::rearm`] to be called again on the next poll.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::core::FIRST_TOKEN;

/// Readiness of one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Token the descriptor was registered with.
    pub token: Token,
    /// Readable (or a pending connection on a listener).
    pub readable: bool,
    /// Error or hang-up reported alongside.
    pub error: bool,
}

/// Descriptors currently registered with a reactor.
///
/// Clones observe the same set.
#[derive(Debug, Clone, Default)]
pub struct Registrations(Rc<RefCell<HashSet<RawFd>>>);

impl Registrations {
    /// Check if `fd` is registered.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.0.borrow().contains(&fd)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Single-threaded readiness reactor.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
    registered: Registrations,
}

impl Reactor {
    /// Create a reactor fetching at most `capacity` events per poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            next_token: FIRST_TOKEN,
            registered: Registrations::default(),
        })
    }

    /// Allocate a fresh token.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1).max(FIRST_TOKEN);
        token
    }

    /// Register `fd` for `interest` under `token`.
    ///
    /// A descriptor that is already registered has its registration
    /// replaced.
    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.registered.contains(fd) {
            return self.rearm(fd, token, interest);
        }
        trace!(fd, token = token.0, ?interest, "register");
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;
        self.registered.0.borrow_mut().insert(fd);
        Ok(())
    }

    /// Replace the registration of an already registered `fd`.
    ///
    /// Readiness that still holds is reported again on the next poll.
    pub fn rearm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        trace!(fd, token = token.0, ?interest, "rearm");
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
    }

    /// Drop the registration of `fd`.
    ///
    /// Failure is logged only: the caller is about to close or hand off the
    /// descriptor either way.
    pub fn deregister(&self, fd: RawFd) {
        trace!(fd, "deregister");
        self.registered.0.borrow_mut().remove(&fd);
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!(fd, error = %e, "deregister failed");
        }
    }

    /// Descriptors registered right now.
    pub fn registrations(&self) -> Registrations {
        self.registered.clone()
    }

    /// Wait for readiness.
    ///
    /// An interrupted wait reports no events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable(),
                error: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            })
            .collect())
    }
}
