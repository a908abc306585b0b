//! # telemetry-plugin-pool
//!
//! Pooling, routing and metric caching for long-lived telemetry plugin
//! workers.
//!
//! ## Architecture
//!
//! ```text
//! PoolRegistry ──► Pool (type:name:version) ──► Strategy ──► MetricCache
//!                   │  instances, subscriptions   LRU │ Sticky │ Config-Based
//!                   └─ eligible() drives launching more instances
//! ```
//!
//! A [`Pool`] holds every running instance of one plugin version. Its
//! [`Strategy`] decides which instance serves a request and owns the
//! metric cache(s) that let repeated requests skip the plugin entirely.
//! The [`PoolRegistry`] ties pools together and runs the
//! check-cache / select / collect / update-cache cycle.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod clock;
pub mod config;
pub mod config_data;
pub mod metric;
pub mod metrics;
pub mod plugin;
pub mod pool;
pub mod registry;
pub mod strategy;
pub mod subscription;

// Re-exports for convenience
pub use cache::{CacheError, MetricCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolSettings, RuntimeConfig};
pub use config_data::{ConfigMap, ConfigValue};
pub use metric::{Metric, Namespace, NamespaceElement};
pub use plugin::{
    AvailablePlugin, EchoClient, PluginClient, PluginError, PluginHandle, PluginMeta, PluginRef,
    PluginType, RoutingStrategyKind,
};
pub use pool::{Pool, PoolError, PoolKey, Subscription};
pub use registry::{PoolHandle, PoolRegistry};
pub use strategy::{RoutingStrategy, Strategy};
pub use subscription::{CounterError, SubscriptionCounter};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=debug`).
///
/// # Errors
///
/// Returns [`RuntimeError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use telemetry_plugin_pool::{init_tracing, RuntimeError};
/// # fn example() -> Result<(), RuntimeError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), RuntimeError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RuntimeError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors.
///
/// Pool, cache and plugin failures surface here when they cross the
/// registry boundary.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A pool or its strategy rejected the operation.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A plugin call failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// No pool is registered under the key.
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl From<CacheError> for RuntimeError {
    fn from(e: CacheError) -> Self {
        Self::Pool(PoolError::Cache(e))
    }
}

impl From<config::validation::ConfigError> for RuntimeError {
    fn from(e: config::validation::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}
