//! Pool identity keys (`type:name:version`).

use super::PoolError;
use crate::plugin::PluginType;
use std::fmt;
use std::str::FromStr;

/// Parsed `type:name:version` identity of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Plugin kind.
    pub plugin_type: PluginType,
    /// Plugin name; may itself contain `:`.
    pub name: String,
    /// Plugin version.
    pub version: i64,
}

impl PoolKey {
    /// Build a key from its parts.
    pub fn new(plugin_type: PluginType, name: impl Into<String>, version: i64) -> Self {
        Self {
            plugin_type,
            name: name.into(),
            version,
        }
    }
}

impl FromStr for PoolKey {
    type Err = PoolError;

    /// The version is the segment after the last `:`, the type the segment
    /// before the first one; everything in between is the name.
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| PoolError::BadKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let (rest, version) = key.rsplit_once(':').ok_or_else(|| bad("missing version"))?;
        let version = version
            .parse::<i64>()
            .map_err(|e| bad(&format!("version is not an integer: {e}")))?;
        let (plugin_type, name) = rest.split_once(':').ok_or_else(|| bad("missing name"))?;
        if plugin_type.is_empty() || name.is_empty() {
            return Err(bad("empty type or name"));
        }

        Ok(Self {
            plugin_type: PluginType::from(plugin_type),
            name: name.to_string(),
            version,
        })
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.plugin_type, self.name, self.version)
    }
}
