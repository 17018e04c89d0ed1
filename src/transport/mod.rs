//! Transport layer: address parsing, the socket I/O adapter, and the
//! readiness reactor.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Migration state machine (external)  │
//! ├─────────────────────────────────────────┤
//! │   migration: connector / acceptor / FT  │
//! ├─────────────────────────────────────────┤
//! │   transport: socket adapter, reactor    │  ← This module
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod address;
mod reactor;
mod socket;

pub use address::parse_host_port;
pub use reactor::{Reactor, Readiness, Registrations};
pub use socket::*;
