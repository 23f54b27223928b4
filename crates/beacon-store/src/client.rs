//! Coordination store contract
//!
//! The registration and discovery layer only talks to the store through this
//! trait, so one connection can be shared (`Arc<dyn StoreClient>`) by any
//! number of registries and discoveries. No holder closes it.

use async_trait::async_trait;

use beacon_common::{LeaseId, Result};

use crate::model::{KeyValue, LeaseGrant, LeaseKeepAlive, ListResponse, PutResponse, WatchOptions};
use crate::watch::{WatchCallback, WatchHandle};

/// Async client of a watch-capable, lease-backed key/value store.
///
/// Implementations report transport failures as
/// `BeaconError::StoreUnavailable` and refusals as
/// `BeaconError::OperationRejected`.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Write or overwrite a key. With a lease, the key is removed when the
    /// lease expires.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<PutResponse>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Remove a key, returning the pair it held.
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All pairs whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<ListResponse>;

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant>;

    /// Renew a lease once. Fails with `BeaconError::LeaseExpired` when the
    /// store no longer knows the lease.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<LeaseKeepAlive>;

    /// Open a watch on `prefix`. Notifications are delivered to `callback`
    /// on a task owned by the returned handle.
    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<WatchHandle>;
}
