//! Constants for the migration transport.
//!
//! The listen backlog is fixed by the connection-setup protocol: one
//! listener serves exactly one migration attempt.

// =============================================================================
// SOCKETS
// =============================================================================

/// Pending-connection backlog for the incoming listener.
pub const LISTEN_BACKLOG: i32 = 1;

/// Host used when the address text leaves the host part empty.
pub const WILDCARD_HOST: &str = "0.0.0.0";

// =============================================================================
// EVENT LOOP
// =============================================================================

/// Default number of readiness events fetched per poll.
pub const DEFAULT_POLL_CAPACITY: usize = 64;

/// First token handed out by the reactor.
///
/// Token 0 is never used so a zeroed token can't alias a live step.
pub const FIRST_TOKEN: usize = 1;

// =============================================================================
// MIGRATION DEFAULTS
// =============================================================================

/// Default outgoing bandwidth limit in bytes per second (32 MiB/s).
pub const DEFAULT_BANDWIDTH_LIMIT: u64 = 32 << 20;

// =============================================================================
// ENVIRONMENT
// =============================================================================

/// Environment variable overriding the poll capacity.
pub const ENV_POLL_CAPACITY: &str = "MIGRATION_POLL_CAPACITY";

/// Environment variable overriding the default bandwidth limit.
pub const ENV_BANDWIDTH_LIMIT: &str = "MIGRATION_BANDWIDTH_LIMIT";

/// Environment variable enabling fault-tolerant receive mode.
pub const ENV_FAULT_TOLERANT: &str = "MIGRATION_FT";
