//! Lease manager
//!
//! Owns the single lease a registering process binds its keys to and keeps it
//! alive from a background task. Stopping (or dropping) the manager ends the
//! heartbeats; the store then expires the lease, and every key bound to it,
//! within one ttl. That expiry is the only deregistration path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use beacon_common::{BeaconError, LeaseId, Result, current_timestamp_ms};
use beacon_store::StoreClient;

use crate::config::LeaseConfig;

/// Renewal bookkeeping shared with the keepalive task
#[derive(Debug)]
struct LeaseState {
    alive: AtomicBool,
    renewals: AtomicU64,
    last_renewed_ms: AtomicI64,
}

impl LeaseState {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            renewals: AtomicU64::new(0),
            last_renewed_ms: AtomicI64::new(current_timestamp_ms()),
        }
    }

    fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        self.last_renewed_ms
            .store(current_timestamp_ms(), Ordering::SeqCst);
    }
}

/// Keeps one store lease alive for the lifetime of the manager
pub struct LeaseManager {
    lease_id: LeaseId,
    ttl: Duration,
    state: Arc<LeaseState>,
    task: JoinHandle<()>,
}

impl LeaseManager {
    /// Grant a lease with the given ttl and start renewing it.
    pub async fn create(client: Arc<dyn StoreClient>, ttl_secs: i64) -> Result<Self> {
        Self::from_config(client, &LeaseConfig::new(ttl_secs)).await
    }

    /// Grant a lease and start renewing it at the configured cadence.
    ///
    /// Fails with `StoreUnavailable` when the store cannot be reached.
    pub async fn from_config(client: Arc<dyn StoreClient>, config: &LeaseConfig) -> Result<Self> {
        let grant = client.lease_grant(config.ttl_secs).await.inspect_err(|e| {
            warn!(ttl_secs = config.ttl_secs, error = %e, "Failed to create lease");
        })?;

        let interval = config.keepalive_interval();
        info!(
            lease_id = grant.id,
            ttl_secs = grant.ttl_secs,
            interval_ms = interval.as_millis() as u64,
            "Lease created"
        );

        let state = Arc::new(LeaseState::new());
        let task = tokio::spawn(keep_alive_loop(client, grant.id, interval, state.clone()));

        Ok(Self {
            lease_id: grant.id,
            ttl: Duration::from_secs(grant.ttl_secs as u64),
            state,
            task,
        })
    }

    pub fn current_lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Ttl granted by the store; the upper bound on deregistration latency
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True while heartbeats are running and the store still knows the lease.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    /// Number of successful keepalives so far
    pub fn renewals(&self) -> u64 {
        self.state.renewals.load(Ordering::SeqCst)
    }

    /// Wall-clock time (ms) of the last successful renewal or of creation
    pub fn last_renewed_at(&self) -> i64 {
        self.state.last_renewed_ms.load(Ordering::SeqCst)
    }

    /// Stop heartbeats. The lease expires within one ttl afterwards.
    pub fn stop(&self) {
        if self.state.alive.swap(false, Ordering::SeqCst) {
            info!(lease_id = self.lease_id, "Stopping lease keepalive");
        }
        self.task.abort();
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("lease_id", &self.lease_id)
            .field("ttl", &self.ttl)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn keep_alive_loop(
    client: Arc<dyn StoreClient>,
    lease_id: LeaseId,
    interval: Duration,
    state: Arc<LeaseState>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just granted
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match client.lease_keep_alive(lease_id).await {
            Ok(resp) => {
                state.record_renewal();
                debug!(lease_id, ttl_secs = resp.ttl_secs, "Lease renewed");
            }
            Err(BeaconError::LeaseExpired(_)) => {
                error!(
                    lease_id,
                    "Lease expired before renewal, bound keys have been removed"
                );
                state.alive.store(false, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!(lease_id, error = %e, "Lease keepalive failed, retrying next tick");
            }
        }
    }
}
