//! In-memory coordination store
//!
//! A single-process implementation of [`StoreClient`] with:
//! - ordered key space with prefix listing
//! - a store-wide revision bumped by every write
//! - leases with TTL deadlines; expired leases delete their keys in one revision
//! - recursive watches fed from a bounded event history, so a watch can start
//!   right after the revision a listing was taken at
//! - fault injection for tests (unavailability, rejected writes, error-flagged
//!   notifications, store-side stream termination)
//!
//! Deadlines use `tokio::time::Instant`, so a paused test clock drives expiry.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_common::{BeaconError, LeaseId, Result, Revision};

use crate::client::StoreClient;
use crate::model::{
    KeyValue, LeaseGrant, LeaseKeepAlive, ListResponse, PutResponse, WatchEvent, WatchOptions,
    WatchResponse,
};
use crate::watch::{WatchCallback, WatchHandle};

/// Reason attached to the final notification of a watch whose start revision
/// is no longer in history.
pub const COMPACTED_REASON: &str = "compacted";

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Number of events kept for watches opened at a past revision
    pub history_capacity: usize,
    /// Lower bound applied to granted lease TTLs
    pub min_lease_ttl_secs: i64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1024,
            min_lease_ttl_secs: 1,
        }
    }
}

#[derive(Debug)]
struct StoredLease {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    options: WatchOptions,
    tx: mpsc::UnboundedSender<WatchResponse>,
}

impl Watcher {
    fn response_for(&self, id: u64, revision: Revision, events: &[WatchEvent]) -> Option<WatchResponse> {
        let matched: Vec<WatchEvent> = events
            .iter()
            .filter(|ev| self.options.matches(&self.prefix, &ev.kv.key))
            .map(|ev| {
                let mut ev = ev.clone();
                if !self.options.prev_kv {
                    ev.prev_kv = None;
                }
                ev
            })
            .collect();

        if matched.is_empty() {
            None
        } else {
            Some(WatchResponse::events(id, revision, matched))
        }
    }
}

struct Inner {
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, StoredLease>,
    revision: Revision,
    next_lease_id: LeaseId,
    history: VecDeque<WatchEvent>,
    /// Highest revision dropped from history; watches must start above it
    compacted: Revision,
    watchers: HashMap<u64, Watcher>,
    available: bool,
    reject_writes: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            revision: 0,
            next_lease_id: 1,
            history: VecDeque::new(),
            compacted: 0,
            watchers: HashMap::new(),
            available: true,
            reject_writes: None,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(BeaconError::StoreUnavailable(
                "memory store is unavailable".to_string(),
            ))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_available()?;
        match &self.reject_writes {
            Some(reason) => Err(BeaconError::OperationRejected(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record events of one revision and fan them out to matching watchers.
    fn publish(&mut self, revision: Revision, events: Vec<WatchEvent>, capacity: usize) {
        self.watchers.retain(|id, watcher| {
            match watcher.response_for(*id, revision, &events) {
                Some(resp) => watcher.tx.send(resp).is_ok(),
                None => !watcher.tx.is_closed(),
            }
        });

        self.history.extend(events);
        while self.history.len() > capacity {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = self.compacted.max(dropped.revision());
            }
        }
    }

    fn detach_from_lease(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease
            && let Some(stored) = self.leases.get_mut(&id)
        {
            stored.keys.remove(key);
        }
    }

    /// Remove every lease whose deadline has passed, deleting bound keys.
    fn expire_leases(&mut self, now: Instant, capacity: usize) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = 0;
        for id in expired {
            let Some(lease) = self.leases.remove(&id) else {
                continue;
            };

            let prevs: Vec<KeyValue> = lease
                .keys
                .iter()
                .filter_map(|key| self.kvs.remove(key))
                .collect();

            if prevs.is_empty() {
                debug!(lease_id = id, "Lease expired with no bound keys");
                continue;
            }

            self.revision += 1;
            let revision = self.revision;
            removed += prevs.len();
            info!(
                lease_id = id,
                keys = prevs.len(),
                revision,
                "Lease expired, removing bound keys"
            );
            let events = prevs
                .into_iter()
                .map(|prev| WatchEvent::delete(prev, revision))
                .collect();
            self.publish(revision, events, capacity);
        }
        removed
    }
}

/// In-process [`StoreClient`] implementation
pub struct MemoryStore {
    config: MemoryStoreConfig,
    inner: Mutex<Inner>,
    next_watch_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
            next_watch_id: AtomicU64::new(1),
        }
    }

    /// Lock the state after applying any lease expiry that is due.
    fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        inner.expire_leases(Instant::now(), self.config.history_capacity);
        inner
    }

    /// Expire due leases now. Returns the number of keys removed.
    pub fn expire_leases(&self) -> usize {
        self.inner
            .lock()
            .expire_leases(Instant::now(), self.config.history_capacity)
    }

    /// Spawn a background task expiring leases every `interval`.
    ///
    /// Expiry also happens lazily on every operation; the reaper makes
    /// deletions (and their watch events) happen without other traffic.
    /// The task ends once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Memory store dropped, stopping lease reaper");
                    break;
                };
                let removed = store.expire_leases();
                if removed > 0 {
                    debug!(removed, "Lease reaper removed expired keys");
                }
            }
        })
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    /// Number of watches still attached to the store
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|_, w| !w.tx.is_closed());
        inner.watchers.len()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Simulate a transport failure: every operation fails with
    /// `StoreUnavailable` while `available` is false.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Refuse writes (put, delete) with the given reason; `None` restores them.
    pub fn reject_writes(&self, reason: Option<String>) {
        self.inner.lock().reject_writes = reason;
    }

    /// Deliver an error-flagged notification to every watch.
    pub fn inject_watch_error(&self, message: &str) {
        let mut inner = self.inner.lock();
        let revision = inner.revision;
        inner
            .watchers
            .retain(|id, w| w.tx.send(WatchResponse::error(*id, revision, message)).is_ok());
    }

    /// End every watch stream from the store side.
    pub fn close_watchers(&self, reason: &str) {
        let mut inner = self.inner.lock();
        let revision = inner.revision;
        for (id, watcher) in inner.watchers.drain() {
            let _ = watcher
                .tx
                .send(WatchResponse::canceled(id, revision, reason));
        }
        warn!(reason, "Closed all watch streams");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<PutResponse> {
        let mut inner = self.lock();
        inner.ensure_writable()?;

        if key.is_empty() {
            return Err(BeaconError::OperationRejected(
                "key is not provided".to_string(),
            ));
        }
        if let Some(id) = lease
            && !inner.leases.contains_key(&id)
        {
            return Err(BeaconError::OperationRejected(format!(
                "requested lease {} not found",
                id
            )));
        }

        inner.revision += 1;
        let revision = inner.revision;
        let prev = inner.kvs.get(key).cloned();

        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            lease,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
        };

        if let Some(p) = &prev
            && p.lease != lease
        {
            inner.detach_from_lease(key, p.lease);
        }
        if let Some(id) = lease
            && let Some(stored) = inner.leases.get_mut(&id)
        {
            stored.keys.insert(key.to_string());
        }

        inner.kvs.insert(key.to_string(), kv.clone());
        inner.publish(
            revision,
            vec![WatchEvent::put(kv, prev.clone())],
            self.config.history_capacity,
        );

        Ok(PutResponse {
            revision,
            prev_kv: prev,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.lock();
        inner.ensure_available()?;
        Ok(inner.kvs.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut inner = self.lock();
        inner.ensure_writable()?;

        let Some(prev) = inner.kvs.remove(key) else {
            return Ok(None);
        };
        inner.detach_from_lease(key, prev.lease);
        inner.revision += 1;
        let revision = inner.revision;
        inner.publish(
            revision,
            vec![WatchEvent::delete(prev.clone(), revision)],
            self.config.history_capacity,
        );
        Ok(Some(prev))
    }

    async fn list(&self, prefix: &str) -> Result<ListResponse> {
        let inner = self.lock();
        inner.ensure_available()?;

        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(ListResponse {
            kvs,
            revision: Some(inner.revision),
        })
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        if ttl_secs <= 0 {
            return Err(BeaconError::OperationRejected(format!(
                "lease ttl must be positive, got {}",
                ttl_secs
            )));
        }
        let ttl_secs = ttl_secs.max(self.config.min_lease_ttl_secs);

        let id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            id,
            StoredLease {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );
        debug!(lease_id = id, ttl_secs, "Granted lease");

        Ok(LeaseGrant { id, ttl_secs })
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<LeaseKeepAlive> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        let stored = inner
            .leases
            .get_mut(&lease)
            .ok_or(BeaconError::LeaseExpired(lease))?;
        stored.deadline = Instant::now() + Duration::from_secs(stored.ttl_secs as u64);

        Ok(LeaseKeepAlive {
            id: lease,
            ttl_secs: stored.ttl_secs,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<WatchHandle> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            prefix: prefix.to_string(),
            options,
            tx,
        };

        match options.start_revision {
            Some(start) if inner.compacted > 0 && start <= inner.compacted => {
                warn!(
                    watch_id = id,
                    start, compacted = inner.compacted,
                    "Watch start revision already compacted"
                );
                let _ = watcher
                    .tx
                    .send(WatchResponse::canceled(id, inner.revision, COMPACTED_REASON));
                return Ok(WatchHandle::spawn(id, rx, callback));
            }
            Some(start) => {
                // Replay one response per historical revision
                let mut pending: Vec<WatchEvent> = Vec::new();
                let mut pending_rev = 0;
                let replay = inner.history.iter().filter(|ev| ev.revision() >= start);
                for ev in replay {
                    if ev.revision() != pending_rev && !pending.is_empty() {
                        if let Some(resp) = watcher.response_for(id, pending_rev, &pending) {
                            let _ = watcher.tx.send(resp);
                        }
                        pending.clear();
                    }
                    pending_rev = ev.revision();
                    pending.push(ev.clone());
                }
                if let Some(resp) = watcher.response_for(id, pending_rev, &pending) {
                    let _ = watcher.tx.send(resp);
                }
            }
            None => {}
        }

        debug!(watch_id = id, prefix, "Opened watch");
        inner.watchers.insert(id, watcher);
        Ok(WatchHandle::spawn(id, rx, callback))
    }
}
