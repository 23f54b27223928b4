//! Store model types

use serde::{Deserialize, Serialize};

use beacon_common::{LeaseId, Revision};

// ============================================================================
// Key-Value Models
// ============================================================================

/// A stored key-value pair with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Lease the key is bound to; `None` for keys that never expire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Number of writes since creation
    pub version: i64,
}

impl KeyValue {
    /// Key-only pair, as carried by the `kv` field of a DELETE event
    pub fn key_only(key: String, mod_revision: Revision) -> Self {
        Self {
            key,
            mod_revision,
            ..Default::default()
        }
    }
}

/// Result of a put
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Store revision after the write
    pub revision: Revision,
    /// Value held before the write, if any
    pub prev_kv: Option<KeyValue>,
}

/// Result of a prefix listing
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision the listing was taken at; `None` when the store cannot
    /// report one, in which case a snapshot-then-watch sequence is racy
    pub revision: Option<Revision>,
}

impl ListResponse {
    /// Iterate `(key, value)` pairs in store order
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.kvs.iter().map(|kv| (kv.key.as_str(), kv.value.as_str()))
    }
}

// ============================================================================
// Lease Models
// ============================================================================

/// A granted lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl_secs: i64,
}

/// Answer to a single keepalive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseKeepAlive {
    pub id: LeaseId,
    /// Remaining time-to-live after the renewal
    pub ttl_secs: i64,
}

// ============================================================================
// Watch Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// New pair for PUT; key-only pair for DELETE
    pub kv: KeyValue,
    /// Pair held before the change (always present on DELETE when the watch
    /// was opened with `prev_kv`)
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    pub fn put(kv: KeyValue, prev_kv: Option<KeyValue>) -> Self {
        Self {
            event_type: EventType::Put,
            kv,
            prev_kv,
        }
    }

    pub fn delete(prev: KeyValue, revision: Revision) -> Self {
        Self {
            event_type: EventType::Delete,
            kv: KeyValue::key_only(prev.key.clone(), revision),
            prev_kv: Some(prev),
        }
    }

    /// Revision at which the change happened
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

/// One notification delivered to a watch callback
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchResponse {
    pub watch_id: u64,
    /// Store revision when the notification was produced
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
    /// Error message for error-flagged notifications
    pub error: Option<String>,
    /// Set on the final notification of a watch stream that the store ended
    pub canceled: bool,
    pub cancel_reason: Option<String>,
}

impl WatchResponse {
    pub fn events(watch_id: u64, revision: Revision, events: Vec<WatchEvent>) -> Self {
        Self {
            watch_id,
            revision,
            events,
            ..Default::default()
        }
    }

    pub fn error(watch_id: u64, revision: Revision, message: impl Into<String>) -> Self {
        Self {
            watch_id,
            revision,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn canceled(watch_id: u64, revision: Revision, reason: impl Into<String>) -> Self {
        Self {
            watch_id,
            revision,
            canceled: true,
            cancel_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

/// Options for opening a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Match every key under the prefix instead of the exact key
    pub recursive: bool,
    /// Attach the previous pair to every event
    pub prev_kv: bool,
    /// Replay history starting at this revision before live events
    pub start_revision: Option<Revision>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            prev_kv: true,
            start_revision: None,
        }
    }
}

impl WatchOptions {
    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }

    /// Whether `key` falls inside a watch opened on `prefix` with these options
    pub fn matches(&self, prefix: &str, key: &str) -> bool {
        if self.recursive {
            key.starts_with(prefix)
        } else {
            key == prefix
        }
    }
}
