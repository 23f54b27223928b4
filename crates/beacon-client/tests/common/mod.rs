//! Shared helpers for client integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use beacon_client::{FnNotifyHandler, NotifyHandler, Result};
use beacon_store::{
    KeyValue, LeaseGrant, LeaseKeepAlive, LeaseId, ListResponse, MemoryStore, PutResponse,
    StoreClient, WatchCallback, WatchHandle, WatchOptions,
};

pub type Calls = Arc<Mutex<Vec<(String, String)>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Handler recording every `(key, value)` it is called with
pub fn recording() -> (Arc<dyn NotifyHandler>, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let handler = FnNotifyHandler::new(move |key: &str, value: &str| {
        sink.lock().push((key.to_string(), value.to_string()));
    });
    (Arc::new(handler), calls)
}

pub fn pair(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

pub fn sorted(calls: &Calls) -> Vec<(String, String)> {
    let mut calls = calls.lock().clone();
    calls.sort();
    calls
}

/// Let spawned delivery tasks drain their queues.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Store wrapper that writes keys right after the first listing returns,
/// before the caller gets to open its watch. Optionally hides the listing
/// revision.
pub struct RacingStore {
    pub inner: Arc<MemoryStore>,
    racing_puts: Mutex<Option<Vec<(String, String)>>>,
    report_revision: bool,
}

impl RacingStore {
    pub fn new(inner: Arc<MemoryStore>, key: &str, value: &str) -> Self {
        Self {
            inner,
            racing_puts: Mutex::new(Some(vec![pair(key, value)])),
            report_revision: true,
        }
    }

    pub fn and_put(self, key: &str, value: &str) -> Self {
        if let Some(puts) = self.racing_puts.lock().as_mut() {
            puts.push(pair(key, value));
        }
        self
    }

    pub fn without_revision(mut self) -> Self {
        self.report_revision = false;
        self
    }
}

#[async_trait]
impl StoreClient for RacingStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<PutResponse> {
        self.inner.put(key, value, lease).await
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<ListResponse> {
        let mut listing = self.inner.list(prefix).await?;
        let racing = self.racing_puts.lock().take().unwrap_or_default();
        for (key, value) in racing {
            self.inner.put(&key, &value, None).await?;
        }
        if !self.report_revision {
            listing.revision = None;
        }
        Ok(listing)
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant> {
        self.inner.lease_grant(ttl_secs).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<LeaseKeepAlive> {
        self.inner.lease_keep_alive(lease).await
    }

    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<WatchHandle> {
        self.inner.watch(prefix, options, callback).await
    }
}

/// Store wrapper whose listings come back in reverse key order and yield to
/// the scheduler before returning.
pub struct ReorderingStore {
    pub inner: Arc<MemoryStore>,
}

impl ReorderingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StoreClient for ReorderingStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<PutResponse> {
        self.inner.put(key, value, lease).await
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<ListResponse> {
        let mut listing = self.inner.list(prefix).await?;
        listing.kvs.reverse();
        tokio::task::yield_now().await;
        Ok(listing)
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrant> {
        self.inner.lease_grant(ttl_secs).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<LeaseKeepAlive> {
        self.inner.lease_keep_alive(lease).await
    }

    async fn watch(
        &self,
        prefix: &str,
        options: WatchOptions,
        callback: WatchCallback,
    ) -> Result<WatchHandle> {
        self.inner.watch(prefix, options, callback).await
    }
}
