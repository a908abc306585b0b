//! Available-plugin handles.
//!
//! ## Responsibility
//! Define the contract the pool manipulates in place of a raw worker process
//! ([`AvailablePlugin`]), the transport boundary that actually talks to the
//! process ([`PluginClient`]), and a concrete handle ([`PluginHandle`]) that
//! joins declared metadata, hit tracking and a client.
//!
//! ## Guarantees
//! - Hit tracking and id assignment use interior mutability, so handles are
//!   shared as `Arc<dyn AvailablePlugin>` between a pool and its strategy.
//! - Unrecognised declared types/strategies are preserved (`Other`) so the
//!   pool can reject them with a typed error instead of failing to parse.
//!
//! ## NOT Responsible For
//! - Launching worker processes or speaking their wire protocol
//! - Deciding which handle serves a request (see `strategy`)

use crate::clock::Clock;
use crate::config_data::ConfigMap;
use crate::metric::Metric;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors reported by a plugin handle or its transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// Graceful stop failed.
    #[error("plugin stop failed: {0}")]
    Stop(String),

    /// Forced kill failed.
    #[error("plugin kill failed: {0}")]
    Kill(String),

    /// The collection call failed.
    #[error("plugin collection failed: {0}")]
    Collect(String),
}

/// Kind of plugin a worker declares itself to be.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PluginType {
    /// Produces metrics on request.
    Collector,
    /// Transforms metrics.
    Processor,
    /// Ships metrics to a sink.
    Publisher,
    /// Pushes metrics over a long-lived stream.
    StreamingCollector,
    /// Anything else a worker might declare; rejected by pools.
    Other(String),
}

impl PluginType {
    /// Whether pools accept instances of this type.
    pub fn is_poolable(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Lower-case name used in pool keys.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Collector => "collector",
            Self::Processor => "processor",
            Self::Publisher => "publisher",
            Self::StreamingCollector => "streaming-collector",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for PluginType {
    fn from(s: &str) -> Self {
        match s {
            "collector" => Self::Collector,
            "processor" => Self::Processor,
            "publisher" => Self::Publisher,
            "streaming-collector" => Self::StreamingCollector,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for PluginType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<PluginType> for String {
    fn from(t: PluginType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing preference a worker declares in its metadata.
///
/// Encoded on the wire as a small integer: `0` least-recently-used,
/// `1` sticky, `2` config-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RoutingStrategyKind {
    /// Pick the instance hit least recently.
    LeastRecentlyUsed,
    /// Pin each task to its own instance.
    Sticky,
    /// Pin each distinct configuration to its own instance.
    ConfigBased,
    /// Unrecognised code; rejected by pools.
    Other(u8),
}

impl RoutingStrategyKind {
    /// Canonical strategy name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LeastRecentlyUsed => "least-recently-used",
            Self::Sticky => "sticky",
            Self::ConfigBased => "config-based",
            Self::Other(_) => "unknown",
        }
    }
}

impl From<u8> for RoutingStrategyKind {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::LeastRecentlyUsed,
            1 => Self::Sticky,
            2 => Self::ConfigBased,
            other => Self::Other(other),
        }
    }
}

impl From<RoutingStrategyKind> for u8 {
    fn from(kind: RoutingStrategyKind) -> Self {
        match kind {
            RoutingStrategyKind::LeastRecentlyUsed => 0,
            RoutingStrategyKind::Sticky => 1,
            RoutingStrategyKind::ConfigBased => 2,
            RoutingStrategyKind::Other(code) => code,
        }
    }
}

impl Default for RoutingStrategyKind {
    fn default() -> Self {
        Self::LeastRecentlyUsed
    }
}

impl fmt::Display for RoutingStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "unknown({code})"),
            known => f.write_str(known.name()),
        }
    }
}

fn default_concurrency_count() -> usize {
    5
}

/// Metadata a worker declares when it starts.
///
/// # Example
///
/// ```rust
/// use telemetry_plugin_pool::plugin::{PluginMeta, PluginType, RoutingStrategyKind};
/// let meta: PluginMeta = serde_json::from_str(
///     r#"{"name":"mock","version":2,"plugin_type":"collector","routing_strategy":1}"#,
/// ).unwrap();
/// assert_eq!(meta.plugin_type, PluginType::Collector);
/// assert_eq!(meta.routing_strategy, RoutingStrategyKind::Sticky);
/// assert_eq!(meta.concurrency_count, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: i64,
    /// Declared plugin kind.
    pub plugin_type: PluginType,
    /// Only one instance may run at a time.
    #[serde(default)]
    pub exclusive: bool,
    /// Subscriptions one instance may serve before another is justified.
    #[serde(default = "default_concurrency_count")]
    pub concurrency_count: usize,
    /// Declared cache TTL in milliseconds; `0` means "use the default".
    #[serde(default)]
    pub cache_ttl_ms: u64,
    /// Declared routing preference.
    #[serde(default)]
    pub routing_strategy: RoutingStrategyKind,
}

impl PluginMeta {
    /// Non-exclusive LRU metadata with the default concurrency count.
    pub fn new(name: impl Into<String>, version: i64, plugin_type: PluginType) -> Self {
        Self {
            name: name.into(),
            version,
            plugin_type,
            exclusive: false,
            concurrency_count: default_concurrency_count(),
            cache_ttl_ms: 0,
            routing_strategy: RoutingStrategyKind::LeastRecentlyUsed,
        }
    }

    /// Pool key (`type:name:version`) for plugins with this metadata.
    pub fn pool_key(&self) -> String {
        format!("{}:{}:{}", self.plugin_type, self.name, self.version)
    }
}

/// The contract a pool and its routing strategy need from a running worker.
#[async_trait]
pub trait AvailablePlugin: Send + Sync + fmt::Debug {
    /// Pool-local id.
    fn id(&self) -> u32;

    /// Assign the pool-local id; called once by [`Pool::insert`](crate::pool::Pool::insert).
    fn set_id(&self, id: u32);

    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version.
    fn version(&self) -> i64;

    /// Declared plugin kind.
    fn plugin_type(&self) -> &PluginType;

    /// Declared cache TTL (`Duration::ZERO` if none).
    fn cache_ttl(&self) -> Duration;

    /// Declared concurrency count.
    fn concurrency_count(&self) -> usize;

    /// Whether only one instance may run.
    fn exclusive(&self) -> bool;

    /// Declared routing preference.
    fn routing_strategy(&self) -> RoutingStrategyKind;

    /// When the instance last served a collection.
    fn last_hit(&self) -> Instant;

    /// How many collections the instance has served.
    fn hit_count(&self) -> u64;

    /// Record that the instance served a collection at `at`.
    fn record_hit(&self, at: Instant);

    /// Ask the worker to exit gracefully.
    fn stop(&self, reason: &str) -> Result<(), PluginError>;

    /// Terminate the worker.
    fn kill(&self, reason: &str) -> Result<(), PluginError>;

    /// Collect `metrics` from the worker.
    async fn collect(&self, metrics: &[Metric], config: &ConfigMap) -> Result<Vec<Metric>, PluginError>;
}

/// Shared reference to a live instance, as held by pools and strategies.
pub type PluginRef = Arc<dyn AvailablePlugin>;

/// Transport to one worker process.
///
/// Implementations speak whatever protocol the worker uses; the pool only
/// sees the outcome.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Collect `metrics` from the worker.
    async fn collect(&self, metrics: &[Metric], config: &ConfigMap) -> Result<Vec<Metric>, PluginError>;

    /// Graceful shutdown.
    fn stop(&self, reason: &str) -> Result<(), PluginError>;

    /// Forced shutdown.
    fn kill(&self, reason: &str) -> Result<(), PluginError>;
}

/// Concrete [`AvailablePlugin`]: declared metadata + hit tracking + client.
pub struct PluginHandle {
    meta: PluginMeta,
    id: AtomicU32,
    hits: AtomicU64,
    last_hit: Mutex<Instant>,
    client: Arc<dyn PluginClient>,
}

impl PluginHandle {
    /// Wrap a running worker. `last_hit` starts at `clock.now()`.
    pub fn new(meta: PluginMeta, client: Arc<dyn PluginClient>, clock: &dyn Clock) -> Self {
        Self {
            meta,
            id: AtomicU32::new(0),
            hits: AtomicU64::new(0),
            last_hit: Mutex::new(clock.now()),
            client,
        }
    }

    /// Declared metadata.
    pub fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("key", &self.meta.pool_key())
            .field("id", &self.id())
            .field("hits", &self.hit_count())
            .finish()
    }
}

#[async_trait]
impl AvailablePlugin for PluginHandle {
    fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    fn name(&self) -> &str {
        &self.meta.name
    }

    fn version(&self) -> i64 {
        self.meta.version
    }

    fn plugin_type(&self) -> &PluginType {
        &self.meta.plugin_type
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.meta.cache_ttl_ms)
    }

    fn concurrency_count(&self) -> usize {
        self.meta.concurrency_count
    }

    fn exclusive(&self) -> bool {
        self.meta.exclusive
    }

    fn routing_strategy(&self) -> RoutingStrategyKind {
        self.meta.routing_strategy
    }

    fn last_hit(&self) -> Instant {
        *self.last_hit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn record_hit(&self, at: Instant) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        *self.last_hit.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    fn stop(&self, reason: &str) -> Result<(), PluginError> {
        self.client.stop(reason)
    }

    fn kill(&self, reason: &str) -> Result<(), PluginError> {
        self.client.kill(reason)
    }

    async fn collect(&self, metrics: &[Metric], config: &ConfigMap) -> Result<Vec<Metric>, PluginError> {
        self.client.collect(metrics, config).await
    }
}

/// Reference client that answers every request in-process.
///
/// Each collected metric carries the 1-based collection call number as its
/// data, which makes cached and fresh values easy to tell apart. Useful for
/// tests and demos without a real worker process.
#[derive(Debug, Default)]
pub struct EchoClient {
    collects: AtomicU64,
    stopped: AtomicBool,
    killed: AtomicBool,
    failing: bool,
}

impl EchoClient {
    /// A client whose stop/kill always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose stop/kill always fail (the worker "did not exit").
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Number of `collect` calls served.
    pub fn collect_count(&self) -> u64 {
        self.collects.load(Ordering::Relaxed)
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Whether `kill` was called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PluginClient for EchoClient {
    async fn collect(&self, metrics: &[Metric], _config: &ConfigMap) -> Result<Vec<Metric>, PluginError> {
        let call = self.collects.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(metrics
            .iter()
            .map(|m| m.clone().with_data(call))
            .collect())
    }

    fn stop(&self, reason: &str) -> Result<(), PluginError> {
        self.stopped.store(true, Ordering::Relaxed);
        if self.failing {
            return Err(PluginError::Stop(format!("worker ignored stop ({reason})")));
        }
        Ok(())
    }

    fn kill(&self, reason: &str) -> Result<(), PluginError> {
        self.killed.store(true, Ordering::Relaxed);
        if self.failing {
            return Err(PluginError::Kill(format!("worker survived kill ({reason})")));
        }
        Ok(())
    }
}
