//! Service registry
//!
//! Announces service instances by writing their keys bound to the process
//! lease. There is no unregister: keys disappear when the lease expires or
//! when someone deletes them.

use std::sync::Arc;

use tracing::{debug, warn};

use beacon_common::{LeaseId, Result, ServiceKey};
use beacon_store::StoreClient;

use crate::config::BeaconConfig;
use crate::lease::LeaseManager;

/// Registers instance keys under one lease
pub struct Registry {
    client: Arc<dyn StoreClient>,
    lease: Arc<LeaseManager>,
}

impl Registry {
    /// Create a registry sharing an existing lease.
    pub fn new(client: Arc<dyn StoreClient>, lease: Arc<LeaseManager>) -> Self {
        Self { client, lease }
    }

    /// Create a registry with its own lease of `ttl_secs`.
    pub async fn connect(client: Arc<dyn StoreClient>, ttl_secs: i64) -> Result<Self> {
        let lease = LeaseManager::create(client.clone(), ttl_secs).await?;
        Ok(Self::new(client, Arc::new(lease)))
    }

    /// Create a registry with its own lease built from `config`.
    pub async fn from_config(client: Arc<dyn StoreClient>, config: &BeaconConfig) -> Result<Self> {
        let lease = LeaseManager::from_config(client.clone(), &config.lease_config()).await?;
        Ok(Self::new(client, Arc::new(lease)))
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease.current_lease_id()
    }

    pub fn lease(&self) -> &Arc<LeaseManager> {
        &self.lease
    }

    /// Write `key -> value` bound to the lease.
    ///
    /// Returns false if the store rejected the write or could not be reached;
    /// the registration then never took effect.
    pub async fn register(&self, key: &str, value: &str) -> bool {
        match self.try_register(key, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to register service");
                false
            }
        }
    }

    /// Same as [`Registry::register`], surfacing the failure.
    pub async fn try_register(&self, key: &str, value: &str) -> Result<()> {
        let lease_id = self.lease_id();
        let resp = self.client.put(key, value, Some(lease_id)).await?;
        debug!(key, value, lease_id, revision = resp.revision, "Registered service");
        Ok(())
    }

    /// Register an instance under the `<namespace>/<service>-<address>` convention.
    pub async fn register_instance(&self, key: &ServiceKey, value: &str) -> bool {
        self.register(&key.to_path(), value).await
    }

    /// Write `key -> value` without a lease. The key outlives this process and
    /// only an explicit delete removes it.
    pub async fn register_unleased(&self, key: &str, value: &str) -> bool {
        match self.client.put(key, value, None).await {
            Ok(resp) => {
                debug!(key, value, revision = resp.revision, "Registered unleased key");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to register unleased key");
                false
            }
        }
    }
}
