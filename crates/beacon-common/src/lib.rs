//! Beacon Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Beacon components:
//! - Error taxonomy shared by the store contract and the client layer
//! - Service key naming convention (`<namespace>/<service>-<host>:<port>`)
//! - Time helpers

pub mod error;
pub mod key;
pub mod utils;

// Re-exports for convenience
pub use error::{BeaconError, Result};
pub use key::ServiceKey;
pub use utils::current_timestamp_ms;

/// Lease handle issued by the coordination store.
pub type LeaseId = i64;

/// Store-wide modification revision.
pub type Revision = i64;

/// Default namespace prefix for service instance keys
pub const DEFAULT_NAMESPACE: &str = "/server";

/// Default lease time-to-live in seconds
pub const DEFAULT_LEASE_TTL_SECS: i64 = 3;
