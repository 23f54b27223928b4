//! Client configuration
//!
//! `BeaconConfig` is layered from an optional file and `BEACON_*` environment
//! variables (e.g. `BEACON_LEASE_TTL_SECS=5`, `BEACON_NAMESPACE=/server`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use beacon_common::{BeaconError, DEFAULT_LEASE_TTL_SECS, DEFAULT_NAMESPACE};

use crate::resubscribe::{ExponentialBackoff, NeverResubscribe, ResubscribePolicy};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BEACON";

/// Floor for the derived keepalive cadence
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for registration and discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Lease time-to-live; also the staleness bound of a crashed instance
    pub lease_ttl_secs: i64,
    /// Explicit keepalive cadence (default: a third of the ttl)
    pub keepalive_interval_ms: Option<u64>,
    /// Namespace prefix instance keys are registered and discovered under
    pub namespace: String,
    /// Start the watch right after the listing's revision when the store reports one
    pub consistent_snapshot: bool,
    /// First resubscribe delay after a watch stream ends; unset disables resubscription
    pub resubscribe_initial_ms: Option<u64>,
    /// Upper bound for the resubscribe delay
    pub resubscribe_max_ms: u64,
    /// Give up after this many failed resubscribe attempts
    pub resubscribe_max_attempts: Option<u32>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            keepalive_interval_ms: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            consistent_snapshot: true,
            resubscribe_initial_ms: None,
            resubscribe_max_ms: 30_000,
            resubscribe_max_attempts: None,
        }
    }
}

impl BeaconConfig {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn with_lease_ttl(mut self, ttl_secs: i64) -> Self {
        self.lease_ttl_secs = ttl_secs;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_consistent_snapshot(mut self, enabled: bool) -> Self {
        self.consistent_snapshot = enabled;
        self
    }

    pub fn with_resubscribe(mut self, initial: Duration, max_attempts: Option<u32>) -> Self {
        self.resubscribe_initial_ms = Some(initial.as_millis() as u64);
        self.resubscribe_max_attempts = max_attempts;
        self
    }

    /// Load from `BEACON_*` environment variables only.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(None)
    }

    /// Load from an optional file, overridden by `BEACON_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder.add_source(env.try_parsing(true)).build()?;

        let config: BeaconConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BeaconError> {
        if self.lease_ttl_secs <= 0 {
            return Err(BeaconError::ConfigError(format!(
                "lease_ttl_secs must be positive, got {}",
                self.lease_ttl_secs
            )));
        }
        if !self.namespace.starts_with('/') {
            return Err(BeaconError::ConfigError(format!(
                "namespace must start with '/', got '{}'",
                self.namespace
            )));
        }
        if self.keepalive_interval_ms == Some(0) {
            return Err(BeaconError::ConfigError(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl_secs: self.lease_ttl_secs,
            keepalive_interval: self.keepalive_interval_ms.map(Duration::from_millis),
        }
    }

    /// Resubscribe strategy described by this configuration
    pub fn resubscribe_policy(&self) -> Arc<dyn ResubscribePolicy> {
        match self.resubscribe_initial_ms {
            Some(initial_ms) => Arc::new(ExponentialBackoff {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(self.resubscribe_max_ms.max(initial_ms)),
                max_attempts: self.resubscribe_max_attempts,
                ..Default::default()
            }),
            None => Arc::new(NeverResubscribe),
        }
    }
}

/// Lease parameters for a `LeaseManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub ttl_secs: i64,
    pub keepalive_interval: Option<Duration>,
}

impl LeaseConfig {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            keepalive_interval: None,
        }
    }

    /// Cadence of keepalives: explicit, or a third of the ttl so a renewal
    /// lands well before every ttl window closes.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval.unwrap_or_else(|| {
            let ttl = Duration::from_secs(self.ttl_secs.max(0) as u64);
            (ttl / 3).max(MIN_KEEPALIVE_INTERVAL)
        })
    }
}
