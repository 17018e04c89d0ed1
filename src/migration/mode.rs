//! Fault-tolerance mode shared by the acceptor, the handshake scheduler
//! and every endpoint of a session.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

/// Fault-tolerant receive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FtMode {
    /// Plain migration.
    #[default]
    Off,
    /// Requested; the fault-tolerant channel is still bootstrapping.
    Init,
    /// Handshake done, receiving transactions.
    TransactionReceiving,
    /// The fault-tolerant channel failed. Cleared when the guest runs.
    Error,
}

impl FtMode {
    /// Check whether `self -> next` is a legal transition.
    ///
    /// `Off`/`Error -> Init` starts a new attempt and `Error -> Off` clears
    /// a failed one. Everything else moves forward through
    /// `Init -> TransactionReceiving -> {Off, Error}`.
    pub fn can_advance_to(self, next: FtMode) -> bool {
        matches!(
            (self, next),
            (FtMode::Off, FtMode::Init)
                | (FtMode::Error, FtMode::Init)
                | (FtMode::Error, FtMode::Off)
                | (FtMode::Init, FtMode::TransactionReceiving)
                | (FtMode::Init, FtMode::Error)
                | (FtMode::TransactionReceiving, FtMode::Off)
                | (FtMode::TransactionReceiving, FtMode::Error)
        )
    }
}

impl fmt::Display for FtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FtMode::Off => "off",
            FtMode::Init => "init",
            FtMode::TransactionReceiving => "transaction-receiving",
            FtMode::Error => "error",
        };
        f.write_str(name)
    }
}

/// Shared handle to a session's [`FtMode`].
///
/// Single-threaded by construction; clones observe the same value.
#[derive(Debug, Clone, Default)]
pub struct FtModeCell(Rc<Cell<FtMode>>);

impl FtModeCell {
    /// Create a cell in `Off`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mode.
    pub fn get(&self) -> FtMode {
        self.0.get()
    }

    /// Advance to `next` if the transition is legal.
    ///
    /// Returns `false` and leaves the mode unchanged otherwise.
    pub fn advance(&self, next: FtMode) -> bool {
        let current = self.0.get();
        if current == next {
            return true;
        }
        if !current.can_advance_to(next) {
            warn!(%current, %next, "rejected fault-tolerance mode transition");
            return false;
        }
        debug!(%current, %next, "fault-tolerance mode transition");
        self.0.set(next);
        true
    }

    /// Request fault-tolerant receive for the next attempt.
    pub fn enable(&self) -> bool {
        self.advance(FtMode::Init)
    }

    /// Check if the mode is `Init`.
    pub fn is_init(&self) -> bool {
        self.get() == FtMode::Init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_off() {
        let mode = FtModeCell::new();
        assert_eq!(mode.get(), FtMode::Off);
        assert!(!mode.is_init());
    }

    #[test]
    fn test_happy_path() {
        let mode = FtModeCell::new();
        assert!(mode.enable());
        assert!(mode.advance(FtMode::TransactionReceiving));
        assert!(mode.advance(FtMode::Off));
        assert_eq!(mode.get(), FtMode::Off);
    }

    #[test]
    fn test_error_leaves_only_to_off_or_init() {
        let mode = FtModeCell::new();
        mode.enable();
        mode.advance(FtMode::TransactionReceiving);
        assert!(mode.advance(FtMode::Error));

        assert!(!mode.advance(FtMode::TransactionReceiving));
        assert_eq!(mode.get(), FtMode::Error);

        // A new attempt may re-arm.
        assert!(mode.enable());
        assert!(mode.is_init());

        assert!(mode.advance(FtMode::Error));
        assert!(mode.advance(FtMode::Off));
        assert_eq!(mode.get(), FtMode::Off);
    }

    #[test]
    fn test_no_skipping_init() {
        let mode = FtModeCell::new();
        assert!(!mode.advance(FtMode::TransactionReceiving));
        assert!(!mode.advance(FtMode::Error));
        assert_eq!(mode.get(), FtMode::Off);
    }

    #[test]
    fn test_no_going_back_to_init() {
        let mode = FtModeCell::new();
        mode.enable();
        mode.advance(FtMode::TransactionReceiving);
        assert!(!mode.advance(FtMode::Init));
    }

    #[test]
    fn test_clones_share_state() {
        let a = FtModeCell::new();
        let b = a.clone();
        a.enable();
        assert!(b.is_init());
    }

    #[test]
    fn test_display() {
        assert_eq!(FtMode::TransactionReceiving.to_string(), "transaction-receiving");
    }
}
