//! # Runtime configuration
//!
//! ## Responsibility
//! Parse and validate the TOML settings that govern pool behaviour: the
//! default cache TTL, the per-pool instance ceiling and the restart budget.
//! These values are threaded explicitly into every [`Pool`](crate::pool::Pool)
//! instead of living in process-wide globals.
//!
//! ## Guarantees
//! - Every field has a documented default, so an empty file is valid
//! - A loaded config is always validated
//! - Deterministic: same TOML input always produces the same config
//!
//! ## NOT Responsible For
//! - Per-plugin metadata (declared by the plugin, see `plugin`)
//! - Per-invocation plugin configuration (see `config_data`)
//!
//! ## Example
//!
//! ```toml
//! [pool]
//! default_cache_ttl_ms = 500
//! max_running_plugins = 3
//! max_plugin_restarts = 3
//! ```

pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

/// Default cache TTL: 500ms.
fn default_cache_ttl_ms() -> u64 {
    500
}

/// Default ceiling on concurrently running instances of one plugin.
fn default_max_running_plugins() -> usize {
    3
}

/// Default number of forced restarts allowed per pool.
fn default_max_plugin_restarts() -> u64 {
    3
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pool settings.
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Settings applied to every pool.
///
/// # Example
///
/// ```rust
/// use telemetry_plugin_pool::config::PoolSettings;
/// let s = PoolSettings::default();
/// assert_eq!(s.max_running_plugins, 3);
/// assert_eq!(s.default_cache_ttl().as_millis(), 500);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Cache TTL used unless a plugin declares a longer one.
    #[serde(default = "default_cache_ttl_ms")]
    pub default_cache_ttl_ms: u64,

    /// Instance ceiling for non-exclusive plugins.
    #[serde(default = "default_max_running_plugins")]
    pub max_running_plugins: usize,

    /// Forced restarts allowed after instance death.
    #[serde(default = "default_max_plugin_restarts")]
    pub max_plugin_restarts: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_cache_ttl_ms: default_cache_ttl_ms(),
            max_running_plugins: default_max_running_plugins(),
            max_plugin_restarts: default_max_plugin_restarts(),
        }
    }
}

impl PoolSettings {
    /// Default cache TTL as a [`Duration`].
    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.default_cache_ttl_ms)
    }

    /// TTL a pool uses for a plugin declaring `declared`: the declared
    /// value when it is set and longer than the default, else the default.
    pub fn effective_cache_ttl(&self, declared: Duration) -> Duration {
        let default = self.default_cache_ttl();
        if !declared.is_zero() && declared > default {
            declared
        } else {
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: RuntimeConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: RuntimeConfig =
            toml::from_str("[pool]\nmax_running_plugins = 7\n").expect("parses");
        assert_eq!(cfg.pool.max_running_plugins, 7);
        assert_eq!(cfg.pool.default_cache_ttl_ms, 500);
        assert_eq!(cfg.pool.max_plugin_restarts, 3);
    }

    #[test]
    fn test_effective_ttl_prefers_longer_declared() {
        let s = PoolSettings::default();
        assert_eq!(s.effective_cache_ttl(Duration::ZERO), Duration::from_millis(500));
        assert_eq!(s.effective_cache_ttl(Duration::from_millis(100)), Duration::from_millis(500));
        assert_eq!(s.effective_cache_ttl(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_settings_serde_round_trip() {
        let s = PoolSettings {
            default_cache_ttl_ms: 250,
            max_running_plugins: 9,
            max_plugin_restarts: 0,
        };
        let text = toml::to_string(&s).expect("serialises");
        let back: PoolSettings = toml::from_str(&text).expect("parses");
        assert_eq!(back, s);
    }
}
