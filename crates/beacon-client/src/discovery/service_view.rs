//! Local view of discovered instances
//!
//! Mirrors what the handlers have been told: a key is present after an up
//! notification and absent after the matching down notification.

use std::collections::BTreeMap;

use dashmap::DashMap;

use beacon_common::ServiceKey;

/// Discovered `key -> value` pairs
pub struct ServiceView {
    instances: DashMap<String, String>,
}

impl ServiceView {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Insert or replace an instance. Returns the previous value.
    pub fn insert(&self, key: &str, value: &str) -> Option<String> {
        self.instances.insert(key.to_string(), value.to_string())
    }

    /// Remove an instance. Returns its last value.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.instances.remove(key).map(|(_, v)| v)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.instances.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Point-in-time copy of the view
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.instances
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.instances.clear();
    }

    /// Instances of one service, for keys following the
    /// `<namespace>/<service>-<address>` convention. Other keys are skipped.
    pub fn instances_of(&self, service_name: &str) -> Vec<(ServiceKey, String)> {
        let mut found: Vec<(ServiceKey, String)> = self
            .instances
            .iter()
            .filter_map(|e| {
                let key = ServiceKey::parse(e.key()).ok()?;
                (key.service_name == service_name).then(|| (key, e.value().clone()))
            })
            .collect();
        found.sort_by(|a, b| a.0.address.cmp(&b.0.address));
        found
    }
}

impl Default for ServiceView {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceView")
            .field("instances", &self.len())
            .finish()
    }
}
