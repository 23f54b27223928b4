//! Memory Store Watch Tests
//!
//! Watch behaviour of the in-memory store: ordering, lease expiry
//! notifications, replay from a revision, and store-side failures.

use std::sync::Arc;
use std::time::Duration;

use beacon_store::memory::COMPACTED_REASON;
use beacon_store::{
    EventType, MemoryStore, MemoryStoreConfig, StoreClient, WatchCallback, WatchOptions,
    WatchResponse,
};
use parking_lot::Mutex;

fn recorder() -> (WatchCallback, Arc<Mutex<Vec<WatchResponse>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: WatchCallback = Arc::new(move |resp| sink.lock().push(resp));
    (callback, seen)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ============== Live Events ==============

#[tokio::test]
async fn test_watch_reports_put_and_delete_in_order() {
    let store = MemoryStore::new();
    let (callback, seen) = recorder();
    let _handle = store
        .watch("/server", WatchOptions::default(), callback)
        .await
        .unwrap();

    store.put("/server/chat-127.0.0.1:9090", "up", None).await.unwrap();
    store.put("/other/a-1.1.1.1:1", "up", None).await.unwrap();
    store.delete("/server/chat-127.0.0.1:9090").await.unwrap();
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);

    let put = &seen[0].events[0];
    assert_eq!(put.event_type, EventType::Put);
    assert_eq!(put.kv.key, "/server/chat-127.0.0.1:9090");
    assert_eq!(put.kv.value, "up");

    let del = &seen[1].events[0];
    assert_eq!(del.event_type, EventType::Delete);
    let prev = del.prev_kv.as_ref().unwrap();
    assert_eq!(prev.key, "/server/chat-127.0.0.1:9090");
    assert_eq!(prev.value, "up");
}

#[tokio::test]
async fn test_non_recursive_watch_matches_exact_key() {
    let store = MemoryStore::new();
    let (callback, seen) = recorder();
    let options = WatchOptions {
        recursive: false,
        ..Default::default()
    };
    let _handle = store.watch("/server/a", options, callback).await.unwrap();

    store.put("/server/a", "1", None).await.unwrap();
    store.put("/server/ab", "1", None).await.unwrap();
    settle().await;

    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_prev_kv_stripped_when_not_requested() {
    let store = MemoryStore::new();
    store.put("/k", "old", None).await.unwrap();

    let (callback, seen) = recorder();
    let options = WatchOptions {
        prev_kv: false,
        ..Default::default()
    };
    let _handle = store.watch("/k", options, callback).await.unwrap();
    store.put("/k", "new", None).await.unwrap();
    settle().await;

    assert!(seen.lock()[0].events[0].prev_kv.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_lease_expiry_emits_deletes_in_one_revision() {
    let store = Arc::new(MemoryStore::new());
    let _reaper = store.spawn_reaper(Duration::from_millis(100));
    let lease = store.lease_grant(1).await.unwrap();
    store.put("/server/a-1.1.1.1:1", "up", Some(lease.id)).await.unwrap();
    store.put("/server/b-1.1.1.1:2", "up", Some(lease.id)).await.unwrap();

    let (callback, seen) = recorder();
    let _handle = store
        .watch("/server", WatchOptions::default(), callback)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].events.len(), 2);
    assert!(seen[0].events.iter().all(|e| e.event_type == EventType::Delete));
    assert!(seen[0].events.iter().all(|e| e.revision() == seen[0].revision));
}

// ============== Replay ==============

#[tokio::test]
async fn test_watch_from_revision_replays_history() {
    let store = MemoryStore::new();
    store.put("/server/a-1.1.1.1:1", "up", None).await.unwrap();
    let listed = store.list("/server").await.unwrap();
    let rev = listed.revision.unwrap();

    // Changes racing between the listing and the watch
    store.put("/server/b-1.1.1.1:2", "up", None).await.unwrap();
    store.delete("/server/a-1.1.1.1:1").await.unwrap();

    let (callback, seen) = recorder();
    let options = WatchOptions::default().with_start_revision(rev + 1);
    let _handle = store.watch("/server", options, callback).await.unwrap();
    store.put("/server/c-1.1.1.1:3", "up", None).await.unwrap();
    settle().await;

    let keys: Vec<(EventType, String)> = seen
        .lock()
        .iter()
        .flat_map(|r| r.events.iter())
        .map(|e| (e.event_type, e.kv.key.clone()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (EventType::Put, "/server/b-1.1.1.1:2".to_string()),
            (EventType::Delete, "/server/a-1.1.1.1:1".to_string()),
            (EventType::Put, "/server/c-1.1.1.1:3".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_watch_from_compacted_revision_is_canceled() {
    let store = MemoryStore::with_config(MemoryStoreConfig {
        history_capacity: 2,
        ..Default::default()
    });
    for i in 0..5 {
        store.put(&format!("/k{}", i), "v", None).await.unwrap();
    }

    let (callback, seen) = recorder();
    let handle = store
        .watch("/", WatchOptions::default().with_start_revision(1), callback)
        .await
        .unwrap();
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].canceled);
    assert_eq!(seen[0].cancel_reason.as_deref(), Some(COMPACTED_REASON));
    assert!(handle.is_finished());
    assert_eq!(store.watcher_count(), 0);
}

// ============== Failures ==============

#[tokio::test]
async fn test_injected_error_keeps_watch_alive() {
    let store = MemoryStore::new();
    let (callback, seen) = recorder();
    let _handle = store
        .watch("/server", WatchOptions::default(), callback)
        .await
        .unwrap();

    store.inject_watch_error("corrupted frame");
    store.put("/server/a-1.1.1.1:1", "up", None).await.unwrap();
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].is_ok());
    assert_eq!(seen[0].error_message(), "corrupted frame");
    assert!(seen[1].is_ok());
}

#[tokio::test]
async fn test_close_watchers_ends_streams() {
    let store = MemoryStore::new();
    let (callback, seen) = recorder();
    let handle = store
        .watch("/server", WatchOptions::default(), callback)
        .await
        .unwrap();

    store.close_watchers("store restarting");
    store.put("/server/a-1.1.1.1:1", "up", None).await.unwrap();
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].canceled);
    assert!(handle.is_finished());
    assert!(!handle.is_cancelled());
}

#[tokio::test]
async fn test_cancelled_watch_detaches() {
    let store = MemoryStore::new();
    let (callback, seen) = recorder();
    let handle = store
        .watch("/server", WatchOptions::default(), callback)
        .await
        .unwrap();
    assert_eq!(store.watcher_count(), 1);

    handle.cancel();
    settle().await;
    store.put("/server/a-1.1.1.1:1", "up", None).await.unwrap();
    settle().await;

    assert!(seen.lock().is_empty());
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_watch_fails_when_unavailable() {
    let store = MemoryStore::new();
    store.set_available(false);
    let (callback, _seen) = recorder();
    assert!(
        store
            .watch("/server", WatchOptions::default(), callback)
            .await
            .is_err()
    );
}
