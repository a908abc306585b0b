//! Per-invocation plugin configuration values.
//!
//! ## Responsibility
//! Hold the configuration map a task passes to a plugin on every
//! collection, and derive the canonical routing key used by config-based
//! routing.
//!
//! ## Guarantees
//! - [`ConfigMap::routing_key`] depends only on map *content*: insertion
//!   order and hash-map iteration order never change it.
//! - Maps that differ in any key or value produce different keys.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A single typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ConfigValue {
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Unordered map of configuration values for one plugin invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(HashMap<String, ConfigValue>);

impl ConfigMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Option<ConfigValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical, order-independent encoding of the whole map.
    ///
    /// Keys are sorted before serialisation so two structurally equal maps
    /// always yield the same string.
    ///
    /// ```rust
    /// use telemetry_plugin_pool::config_data::ConfigMap;
    /// let a = ConfigMap::new().with("user", "root").with("port", 22i64);
    /// let b = ConfigMap::new().with("port", 22i64).with("user", "root");
    /// assert_eq!(a.routing_key(), b.routing_key());
    /// ```
    pub fn routing_key(&self) -> String {
        let sorted: BTreeMap<&String, &ConfigValue> = self.0.iter().collect();
        // Serialising plain enums and string keys cannot fail; fall back to
        // Debug output of the sorted map just in case.
        serde_json::to_string(&sorted).unwrap_or_else(|_| format!("{sorted:?}"))
    }
}

impl FromIterator<(String, ConfigValue)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (String, ConfigValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
