//! Core traits, errors, and constants.
//!
//! This module has no dependency on the event loop and defines the
//! collaborator interfaces the transport hands its sockets to.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
