//! Locality attribute bags consumed by the policy evaluator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute key within a [`LocalityData`] bag.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalityKey(String);

impl LocalityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn zone_id() -> Self {
        Self("zoneid".to_string())
    }

    pub fn machine_id() -> Self {
        Self("machineid".to_string())
    }

    pub fn dc_id() -> Self {
        Self("dcid".to_string())
    }

    pub fn process_id() -> Self {
        Self("processid".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LocalityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LocalityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque attribute bag (zone/machine/dc/...) describing where a process
/// runs. Only the policy evaluator interprets it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalityData {
    attributes: BTreeMap<LocalityKey, String>,
}

impl LocalityData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common zone/machine/dc shape.
    pub fn for_zone(dc: &str, zone: &str, machine: &str) -> Self {
        let mut data = Self::new();
        data.set(LocalityKey::dc_id(), dc);
        data.set(LocalityKey::zone_id(), zone);
        data.set(LocalityKey::machine_id(), machine);
        data
    }

    pub fn set(&mut self, key: LocalityKey, value: impl Into<String>) {
        self.attributes.insert(key, value.into());
    }

    pub fn get(&self, key: &LocalityKey) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
