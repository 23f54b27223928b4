//! Beacon Client - service registration and discovery
//!
//! This crate provides:
//! - `LeaseManager`: one store lease per process, kept alive by a background task
//! - `Registry`: binds instance keys to that lease
//! - `Discovery`: snapshot listing of a namespace followed by a watch, dispatching
//!   up/down notifications to caller-supplied handlers
//! - `ResubscribePolicy`: opt-in recovery when a watch stream ends
//! - `BeaconConfig`: configuration loaded from files and `BEACON_*` variables

pub mod config;
pub mod discovery;
pub mod lease;
pub mod registry;
pub mod resubscribe;

pub use beacon_common::{BeaconError, Result, ServiceKey};
pub use config::{BeaconConfig, LeaseConfig};
pub use discovery::listener::{FnNotifyHandler, NoopHandler, NotifyHandler};
pub use discovery::service_view::ServiceView;
pub use discovery::{Discovery, DiscoveryOptions, DiscoveryState};
pub use lease::LeaseManager;
pub use registry::Registry;
pub use resubscribe::{ExponentialBackoff, FixedDelay, NeverResubscribe, ResubscribePolicy};
