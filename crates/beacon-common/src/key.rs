//! Service instance key naming
//!
//! Instance keys follow `<namespace>/<service_name>-<address>`, e.g.
//! `/server/user-127.0.0.1:8080`. The namespace is the discovery scope; the
//! address is everything after the last `-` of the trailing segment.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{BeaconError, Result};
use crate::utils::normalize_namespace;

static SERVICE_NAME_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new("^[a-zA-Z0-9_.-]+$").expect("Invalid service name pattern")
});

/// Addresses may not contain `-`, otherwise the key would not parse back.
static ADDRESS_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-zA-Z0-9_.:\[\]%]+$").expect("Invalid address pattern")
});

/// Unique key of one instance of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub service_name: String,
    pub address: String,
}

impl ServiceKey {
    /// Build a key, validating every component.
    ///
    /// # Examples
    ///
    /// ```
    /// use beacon_common::ServiceKey;
    ///
    /// let key = ServiceKey::new("/server", "user", "127.0.0.1:8080").unwrap();
    /// assert_eq!(key.to_string(), "/server/user-127.0.0.1:8080");
    /// ```
    pub fn new(namespace: &str, service_name: &str, address: &str) -> Result<Self> {
        let namespace = normalize_namespace(namespace);
        let key = Self {
            namespace,
            service_name: service_name.to_string(),
            address: address.to_string(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Parse a full instance key.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || BeaconError::InvalidServiceKey(raw.to_string());

        let slash = raw.rfind('/').ok_or_else(invalid)?;
        let (namespace, segment) = (&raw[..slash], &raw[slash + 1..]);
        let dash = segment.rfind('-').ok_or_else(invalid)?;
        let (service_name, address) = (&segment[..dash], &segment[dash + 1..]);

        if !raw.starts_with('/') || namespace.ends_with('/') {
            return Err(invalid());
        }

        let key = Self {
            namespace: namespace.to_string(),
            service_name: service_name.to_string(),
            address: address.to_string(),
        };
        key.validate().map_err(|_| invalid())?;
        Ok(key)
    }

    /// Full store path of this key.
    pub fn to_path(&self) -> String {
        format!("{}/{}-{}", self.namespace, self.service_name, self.address)
    }

    /// Host part of the address (everything before the last `:`).
    pub fn host(&self) -> &str {
        match self.address.rfind(':') {
            Some(pos) => &self.address[..pos],
            None => &self.address,
        }
    }

    /// Port part of the address, if present and numeric.
    pub fn port(&self) -> Option<u16> {
        self.address
            .rfind(':')
            .and_then(|pos| self.address[pos + 1..].parse().ok())
    }

    /// Whether this key lives under the given namespace prefix.
    pub fn is_under(&self, namespace: &str) -> bool {
        let namespace = normalize_namespace(namespace);
        self.namespace == namespace || self.namespace.starts_with(&format!("{}/", namespace))
    }

    fn validate(&self) -> Result<()> {
        if !SERVICE_NAME_PATTERN.is_match(&self.service_name) {
            return Err(BeaconError::InvalidServiceKey(format!(
                "service name '{}'",
                self.service_name
            )));
        }
        if !ADDRESS_PATTERN.is_match(&self.address) {
            return Err(BeaconError::InvalidServiceKey(format!(
                "address '{}'",
                self.address
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.namespace, self.service_name, self.address)
    }
}

impl FromStr for ServiceKey {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
