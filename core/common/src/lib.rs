//! Common utilities and types shared across the Lantern offline core.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, identifiers for queued work, the store collections and a
//! clock abstraction so that time-dependent behavior can be tested.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{ActionId, Collection, ConnectivityState, ErrorKind, Severity};
