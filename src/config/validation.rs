//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RuntimeConfig`] that cannot
//! be expressed through the type system alone.
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::RuntimeConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "pool.max_running_plugins").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Upper bound on the per-pool instance ceiling.
const MAX_RUNNING_PLUGINS_LIMIT: usize = 64;

/// Validate all semantic constraints on a [`RuntimeConfig`].
///
/// A restart budget of zero is allowed and disables restarts.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &RuntimeConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let pool = &config.pool;

    if pool.default_cache_ttl_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "pool.default_cache_ttl_ms".into(),
            value: "0".into(),
            reason: "must be at least 1ms".into(),
        });
    }

    if pool.max_running_plugins == 0 {
        errors.push(ConfigError::InvalidField {
            field: "pool.max_running_plugins".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if pool.max_running_plugins > MAX_RUNNING_PLUGINS_LIMIT {
        errors.push(ConfigError::InvalidField {
            field: "pool.max_running_plugins".into(),
            value: pool.max_running_plugins.to_string(),
            reason: format!("must be \u{2264} {MAX_RUNNING_PLUGINS_LIMIT}"),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;

    fn config(pool: PoolSettings) -> RuntimeConfig {
        RuntimeConfig { pool }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let errs = validate(&config(PoolSettings {
            default_cache_ttl_ms: 0,
            ..PoolSettings::default()
        }))
        .expect_err("must fail");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].to_string().contains("pool.default_cache_ttl_ms"));
    }

    #[test]
    fn test_zero_max_rejected() {
        let errs = validate(&config(PoolSettings {
            max_running_plugins: 0,
            ..PoolSettings::default()
        }))
        .expect_err("must fail");
        assert!(errs[0].to_string().contains("at least 1"));
    }

    #[test]
    fn test_huge_max_rejected() {
        let errs = validate(&config(PoolSettings {
            max_running_plugins: 1000,
            ..PoolSettings::default()
        }))
        .expect_err("must fail");
        assert!(errs[0].to_string().contains("1000"));
    }

    #[test]
    fn test_zero_restart_budget_allowed() {
        assert!(validate(&config(PoolSettings {
            max_plugin_restarts: 0,
            ..PoolSettings::default()
        }))
        .is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let errs = validate(&config(PoolSettings {
            default_cache_ttl_ms: 0,
            max_running_plugins: 0,
            max_plugin_restarts: 1,
        }))
        .expect_err("must fail");
        assert_eq!(errs.len(), 2);
    }
}
