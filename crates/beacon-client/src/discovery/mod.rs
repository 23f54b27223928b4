//! Watch-driven service discovery
//!
//! `discover(prefix)` lists every key under the prefix, reports each one as
//! up, then watches the prefix and translates PUT events into up and DELETE
//! events into down notifications.
//!
//! When the store reports the listing's revision, the watch starts right after
//! it, so no change between the two phases is missed or reported twice.
//!
//! A watch stream that ends moves the discovery to `Stopped` and the local
//! view goes stale. By default nothing else happens; with a
//! [`ResubscribePolicy`] that allows it, the discovery lists again, reports
//! the difference against what it reported before, and watches again.
//!
//! If the listing's revision is compacted before the watch opens, the store
//! cancels the watch right away; the discovery then lists again immediately,
//! whatever the policy.

pub mod listener;
pub mod service_view;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_common::{BeaconError, Result, Revision};
use beacon_store::{
    COMPACTED_REASON, EventType, ListResponse, StoreClient, WatchCallback, WatchEvent, WatchHandle,
    WatchOptions, WatchResponse,
};

use crate::config::BeaconConfig;
use crate::resubscribe::{NeverResubscribe, ResubscribePolicy};

use self::listener::{FnNotifyHandler, NotifyHandler};
use self::service_view::ServiceView;

/// Lifecycle of a discovery instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// `discover` has not succeeded yet
    Unstarted,
    /// Snapshot delivered and the watch is live
    Active,
    /// Torn down, or the watch stream ended; no further notifications
    Stopped,
}

/// Tunables for a discovery instance
#[derive(Clone)]
pub struct DiscoveryOptions {
    /// Start the watch right after the listing's revision when available
    pub consistent_snapshot: bool,
    /// What to do when the watch stream ends
    pub resubscribe: Arc<dyn ResubscribePolicy>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            consistent_snapshot: true,
            resubscribe: Arc::new(NeverResubscribe),
        }
    }
}

impl DiscoveryOptions {
    pub fn from_config(config: &BeaconConfig) -> Self {
        Self {
            consistent_snapshot: config.consistent_snapshot,
            resubscribe: config.resubscribe_policy(),
        }
    }

    pub fn with_resubscribe(mut self, policy: impl ResubscribePolicy) -> Self {
        self.resubscribe = Arc::new(policy);
        self
    }
}

impl std::fmt::Debug for DiscoveryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryOptions")
            .field("consistent_snapshot", &self.consistent_snapshot)
            .field("resubscribe_enabled", &self.resubscribe.next_delay(0).is_some())
            .finish()
    }
}

/// A change to report to the handlers
#[derive(Debug, Clone, PartialEq, Eq)]
enum Notification {
    Up { key: String, value: String },
    Down { key: String, value: String },
}

/// Map one watch event to a notification.
///
/// A DELETE must carry the previous pair: its value is what `on_down` reports.
fn translate(event: &WatchEvent) -> Result<Notification> {
    match event.event_type {
        EventType::Put if event.kv.key.is_empty() => Err(BeaconError::WatchEventError(
            "put event without a key".to_string(),
        )),
        EventType::Put => Ok(Notification::Up {
            key: event.kv.key.clone(),
            value: event.kv.value.clone(),
        }),
        EventType::Delete => match &event.prev_kv {
            Some(prev) => Ok(Notification::Down {
                key: prev.key.clone(),
                value: prev.value.clone(),
            }),
            None => Err(BeaconError::WatchEventError(format!(
                "delete event for '{}' without previous value",
                event.kv.key
            ))),
        },
    }
}

struct Status {
    state: DiscoveryState,
    prefix: Option<String>,
    /// Prefix the cached view was built for
    view_prefix: Option<String>,
    watch: Option<WatchHandle>,
    resubscribe: Option<JoinHandle<()>>,
    /// Generation whose watch stream has ended
    ended: u64,
}

struct Shared {
    client: Arc<dyn StoreClient>,
    on_up: Arc<dyn NotifyHandler>,
    on_down: Arc<dyn NotifyHandler>,
    options: DiscoveryOptions,
    view: ServiceView,
    status: parking_lot::Mutex<Status>,
    /// Bumped by every subscription and by `stop`; notifications from an
    /// older watch are ignored
    generation: AtomicU64,
    last_revision: AtomicI64,
    subscribe_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::Up { key, value } => {
                self.view.insert(&key, &value);
                self.on_up.notify(&key, &value);
            }
            Notification::Down { key, value } => {
                self.view.remove(&key);
                self.on_down.notify(&key, &value);
            }
        }
    }

    /// Bring the view in line with a fresh listing, reporting the difference.
    ///
    /// Starting from an empty view this reports every listed key as up.
    fn reconcile(&self, listing: &ListResponse) {
        let listed: HashMap<&str, &str> = listing.pairs().collect();

        for (key, value) in self.view.snapshot() {
            if !listed.contains_key(key.as_str()) {
                self.dispatch(Notification::Down { key, value });
            }
        }
        for (key, value) in listing.pairs() {
            if self.view.get(key).as_deref() != Some(value) {
                self.dispatch(Notification::Up {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }
}

/// Maintains a live view of the instances under one namespace prefix
pub struct Discovery {
    shared: Arc<Shared>,
}

impl Discovery {
    /// Create a discovery reporting to `on_up` and `on_down`.
    ///
    /// Handlers run on the watch delivery task, not on the caller's, except for
    /// the snapshot phase of `discover`, which runs on the calling task.
    pub fn new(
        client: Arc<dyn StoreClient>,
        on_up: Arc<dyn NotifyHandler>,
        on_down: Arc<dyn NotifyHandler>,
    ) -> Self {
        Self::with_options(client, on_up, on_down, DiscoveryOptions::default())
    }

    pub fn with_options(
        client: Arc<dyn StoreClient>,
        on_up: Arc<dyn NotifyHandler>,
        on_down: Arc<dyn NotifyHandler>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                on_up,
                on_down,
                options,
                view: ServiceView::new(),
                status: parking_lot::Mutex::new(Status {
                    state: DiscoveryState::Unstarted,
                    prefix: None,
                    view_prefix: None,
                    watch: None,
                    resubscribe: None,
                    ended: 0,
                }),
                generation: AtomicU64::new(0),
                last_revision: AtomicI64::new(0),
                subscribe_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a discovery from two closures.
    pub fn from_fns<U, D>(client: Arc<dyn StoreClient>, on_up: U, on_down: D) -> Self
    where
        U: Fn(&str, &str) + Send + Sync + 'static,
        D: Fn(&str, &str) + Send + Sync + 'static,
    {
        Self::new(
            client,
            Arc::new(FnNotifyHandler::new(on_up)),
            Arc::new(FnNotifyHandler::new(on_down)),
        )
    }

    /// List `prefix`, report every instance as up, then watch for changes.
    ///
    /// Returns false if the listing or the watch could not be established, or
    /// if this discovery is already active. No watch is left behind on failure.
    pub async fn discover(&self, prefix: &str) -> bool {
        match self.try_discover(prefix).await {
            Ok(()) => true,
            Err(e) => {
                warn!(prefix, error = %e, "Service discovery failed");
                false
            }
        }
    }

    /// Same as [`Discovery::discover`], surfacing the failure.
    pub async fn try_discover(&self, prefix: &str) -> Result<()> {
        if let Some(task) = self.shared.status.lock().resubscribe.take() {
            task.abort();
        }
        subscribe(&self.shared, prefix).await
    }

    /// Cancel the watch and any pending resubscription.
    ///
    /// A notification already being handled may still complete.
    pub fn stop(&self) {
        let mut status = self.shared.status.lock();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = status.resubscribe.take() {
            task.abort();
        }
        if let Some(handle) = status.watch.take() {
            handle.cancel();
        }
        if status.state == DiscoveryState::Active {
            info!(prefix = status.prefix.as_deref(), "Discovery stopped");
        }
        if status.state != DiscoveryState::Unstarted {
            status.state = DiscoveryState::Stopped;
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.shared.status.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == DiscoveryState::Active
    }

    /// Prefix of the last successful `discover`
    pub fn prefix(&self) -> Option<String> {
        self.shared.status.lock().prefix.clone()
    }

    /// Highest store revision reflected in the view
    pub fn revision(&self) -> Revision {
        self.shared.last_revision.load(Ordering::SeqCst)
    }

    /// Instances reported up and not yet reported down
    pub fn view(&self) -> &ServiceView {
        &self.shared.view
    }

    pub fn instances(&self) -> Vec<(String, String)> {
        self.shared.view.snapshot().into_iter().collect()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("Discovery")
            .field("state", &status.state)
            .field("prefix", &status.prefix)
            .field("instances", &self.shared.view.len())
            .finish()
    }
}

/// Snapshot `prefix` into the view, then open a watch for later changes.
async fn subscribe(shared: &Arc<Shared>, prefix: &str) -> Result<()> {
    let _guard = shared.subscribe_lock.lock().await;
    {
        let mut status = shared.status.lock();
        if status.state == DiscoveryState::Active {
            return Err(BeaconError::OperationRejected(format!(
                "discovery already active on '{}'",
                status.prefix.as_deref().unwrap_or_default()
            )));
        }
        // Keys cached under another prefix are out of scope, not down
        if status.view_prefix.as_deref() != Some(prefix) {
            if !shared.view.is_empty() {
                debug!(
                    prefix,
                    previous = status.view_prefix.as_deref(),
                    dropped = shared.view.len(),
                    "Prefix changed, dropping cached instances"
                );
            }
            shared.view.clear();
            status.view_prefix = Some(prefix.to_string());
        }
    }
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let listing = shared.client.list(prefix).await?;
    shared.reconcile(&listing);

    if let Some(revision) = listing.revision {
        shared.last_revision.fetch_max(revision, Ordering::SeqCst);
    }

    let mut options = WatchOptions::default();
    match listing.revision {
        Some(revision) if shared.options.consistent_snapshot => {
            options = options.with_start_revision(revision + 1);
        }
        _ => {
            debug!(
                prefix,
                "Watching from the current revision; changes made since the listing are not replayed"
            );
        }
    }

    let weak: Weak<Shared> = Arc::downgrade(shared);
    let watch_prefix = prefix.to_string();
    let callback: WatchCallback = Arc::new(move |resp| {
        if let Some(shared) = weak.upgrade() {
            handle_response(&shared, generation, &watch_prefix, resp);
        }
    });
    let handle = shared.client.watch(prefix, options, callback).await?;

    let mut status = shared.status.lock();
    if shared.generation.load(Ordering::SeqCst) != generation {
        handle.cancel();
        return Err(BeaconError::OperationRejected(
            "discovery stopped while subscribing".to_string(),
        ));
    }
    if status.ended != generation {
        status.state = DiscoveryState::Active;
    }
    status.prefix = Some(prefix.to_string());
    status.watch = Some(handle);

    info!(
        prefix,
        instances = shared.view.len(),
        revision = ?listing.revision,
        "Discovery subscribed"
    );
    Ok(())
}

fn handle_response(shared: &Arc<Shared>, generation: u64, prefix: &str, resp: WatchResponse) {
    if shared.generation.load(Ordering::SeqCst) != generation {
        debug!(watch_id = resp.watch_id, "Ignoring notification from a replaced watch");
        return;
    }

    if !resp.is_ok() {
        let err = BeaconError::WatchEventError(resp.error_message().to_string());
        warn!(prefix, watch_id = resp.watch_id, error = %err, "Dropping watch notification");
    } else {
        for event in &resp.events {
            match translate(event) {
                Ok(notification) => shared.dispatch(notification),
                Err(e) => warn!(prefix, error = %e, "Dropping watch event"),
            }
        }
        shared.last_revision.fetch_max(resp.revision, Ordering::SeqCst);
    }

    if resp.canceled {
        on_stream_end(shared, generation, prefix, resp.cancel_reason.as_deref());
    }
}

fn on_stream_end(shared: &Arc<Shared>, generation: u64, prefix: &str, reason: Option<&str>) {
    let mut status = shared.status.lock();
    if shared.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    status.ended = generation;
    status.state = DiscoveryState::Stopped;
    status.watch = None;

    let compacted = reason == Some(COMPACTED_REASON);
    if !compacted && shared.options.resubscribe.next_delay(0).is_none() {
        warn!(
            prefix,
            reason,
            instances = shared.view.len(),
            "Watch stream ended; discovered instances are no longer updated"
        );
        return;
    }

    if compacted {
        warn!(prefix, "Listing revision compacted before the watch opened, listing again");
    } else {
        warn!(prefix, reason, "Watch stream ended, resubscribing");
    }
    let task = tokio::spawn(resubscribe_loop(
        Arc::downgrade(shared),
        prefix.to_string(),
        compacted,
    ));
    if let Some(old) = status.resubscribe.replace(task) {
        old.abort();
    }
}

/// Subscribe again until it succeeds or the policy gives up. With
/// `immediate`, a first attempt runs without delay and outside the policy.
async fn resubscribe_loop(weak: Weak<Shared>, prefix: String, immediate: bool) {
    let mut attempt = 0;
    let mut immediate = immediate;
    loop {
        let delay = if immediate {
            immediate = false;
            Duration::ZERO
        } else {
            let next = match weak.upgrade() {
                Some(shared) => shared.options.resubscribe.next_delay(attempt),
                None => return,
            };
            let Some(delay) = next else {
                warn!(prefix, attempts = attempt, "Giving up resubscribing");
                return;
            };
            attempt += 1;
            delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        match subscribe(&shared, &prefix).await {
            Ok(()) => {
                info!(prefix, attempt, "Resubscribed");
                return;
            }
            Err(e) => {
                warn!(prefix, attempt, error = %e, "Resubscribe attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_store::{KeyValue, MemoryStore};
    use parking_lot::Mutex;

    type Calls = Arc<Mutex<Vec<(String, String)>>>;

    fn recording() -> (Arc<dyn NotifyHandler>, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let handler = FnNotifyHandler::new(move |key: &str, value: &str| {
            sink.lock().push((key.to_string(), value.to_string()));
        });
        (Arc::new(handler), calls)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_translate_put() {
        let event = WatchEvent::put(kv("/server/user-127.0.0.1:8080", "up"), None);
        assert_eq!(
            translate(&event).unwrap(),
            Notification::Up {
                key: "/server/user-127.0.0.1:8080".to_string(),
                value: "up".to_string(),
            }
        );
    }

    #[test]
    fn test_translate_delete_uses_previous_pair() {
        let event = WatchEvent::delete(kv("/server/user-127.0.0.1:8080", "up"), 2);
        assert_eq!(
            translate(&event).unwrap(),
            Notification::Down {
                key: "/server/user-127.0.0.1:8080".to_string(),
                value: "up".to_string(),
            }
        );
    }

    #[test]
    fn test_translate_malformed_events() {
        let keyless = WatchEvent::put(kv("", "up"), None);
        assert!(matches!(
            translate(&keyless),
            Err(BeaconError::WatchEventError(_))
        ));

        let mut bare_delete = WatchEvent::delete(kv("/server/a-1.1.1.1:1", "up"), 2);
        bare_delete.prev_kv = None;
        assert!(matches!(
            translate(&bare_delete),
            Err(BeaconError::WatchEventError(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_reports_snapshot_then_watches() {
        let store = Arc::new(MemoryStore::new());
        store.put("/server/user-127.0.0.1:8080", "up", None).await.unwrap();

        let (on_up, ups) = recording();
        let (on_down, downs) = recording();
        let discovery = Discovery::new(store.clone(), on_up, on_down);
        assert_eq!(discovery.state(), DiscoveryState::Unstarted);

        assert!(discovery.discover("/server").await);
        assert!(discovery.is_active());
        assert_eq!(discovery.prefix().as_deref(), Some("/server"));
        assert_eq!(ups.lock().len(), 1);

        store.delete("/server/user-127.0.0.1:8080").await.unwrap();
        settle().await;
        assert_eq!(
            downs.lock().as_slice(),
            &[("/server/user-127.0.0.1:8080".to_string(), "up".to_string())]
        );
        assert!(discovery.view().is_empty());
    }

    #[tokio::test]
    async fn test_discover_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let discovery = Discovery::from_fns(store.clone(), |_, _| {}, |_, _| {});
        assert!(discovery.discover("/server").await);
        assert!(!discovery.discover("/server").await);
        assert_eq!(store.watcher_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_watch() {
        let store = Arc::new(MemoryStore::new());
        let (on_up, ups) = recording();
        let (on_down, _) = recording();
        let discovery = Discovery::new(store.clone(), on_up, on_down);
        assert!(discovery.discover("/server").await);

        discovery.stop();
        assert_eq!(discovery.state(), DiscoveryState::Stopped);
        settle().await;

        store.put("/server/user-127.0.0.1:8080", "up", None).await.unwrap();
        settle().await;
        assert!(ups.lock().is_empty());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_cancels_watch() {
        let store = Arc::new(MemoryStore::new());
        {
            let discovery = Discovery::from_fns(store.clone(), |_, _| {}, |_, _| {});
            assert!(discovery.discover("/server").await);
            assert_eq!(store.watcher_count(), 1);
        }
        settle().await;
        assert_eq!(store.watcher_count(), 0);
    }

    #[test]
    fn test_options_from_config() {
        let config = BeaconConfig::default()
            .with_consistent_snapshot(false)
            .with_resubscribe(std::time::Duration::from_millis(100), None);
        let options = DiscoveryOptions::from_config(&config);
        assert!(!options.consistent_snapshot);
        assert!(options.resubscribe.next_delay(0).is_some());

        let defaults = DiscoveryOptions::default();
        assert!(defaults.consistent_snapshot);
        assert!(defaults.resubscribe.next_delay(0).is_none());
    }
}
