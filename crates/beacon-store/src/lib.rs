//! Beacon Store - coordination store contract
//!
//! This crate provides:
//! - `StoreClient`: the async contract the registration/discovery layer relies on
//!   (put, get, delete, prefix list, leases, recursive watches)
//! - Model types for store responses and watch notifications
//! - `MemoryStore`: an in-process implementation with lease expiry, revisions,
//!   bounded watch history and fault injection

pub mod client;
pub mod memory;
pub mod model;
pub mod watch;

pub use beacon_common::{LeaseId, Revision};
pub use client::StoreClient;
pub use memory::{COMPACTED_REASON, MemoryStore, MemoryStoreConfig};
pub use model::*;
pub use watch::{STREAM_CLOSED_REASON, WatchCallback, WatchHandle};
