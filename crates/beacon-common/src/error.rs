//! Error types for Beacon
//!
//! `BeaconError` is the single error taxonomy shared by the coordination store
//! contract (`beacon-store`) and the registration/discovery layer
//! (`beacon-client`).

use crate::LeaseId;

/// Beacon error taxonomy
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    /// Connection or transport failure towards the store
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store was reachable but refused the operation
    #[error("operation rejected: {0}")]
    OperationRejected(String),

    /// Malformed or error-flagged watch notification
    #[error("watch event error: {0}")]
    WatchEventError(String),

    /// Lease is unknown to the store (it expired or never existed)
    #[error("lease {0} expired or not found")]
    LeaseExpired(LeaseId),

    #[error("invalid service key '{0}'")]
    InvalidServiceKey(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl BeaconError {
    /// Whether the failure is worth retrying later (transport-level only).
    pub fn is_transient(&self) -> bool {
        matches!(self, BeaconError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, BeaconError>;
