//! Config-based routing: one instance per distinct configuration.
//!
//! Pinning works like [`Sticky`](super::Sticky), but the routing key is the
//! canonical encoding of the invocation's configuration map. Tasks that
//! pass equal configurations share an instance (and its cache); tasks with
//! different configurations are spread across instances.

use super::pinned::Pinned;
use super::RoutingStrategy;
use crate::cache::CacheError;
use crate::clock::Clock;
use crate::config_data::ConfigMap;
use crate::metric::Metric;
use crate::plugin::{PluginRef, RoutingStrategyKind};
use crate::pool::PoolError;
use std::sync::Arc;
use std::time::Duration;

/// Configuration-pinned strategy.
#[derive(Debug)]
pub struct ConfigBased {
    inner: Pinned,
}

impl ConfigBased {
    /// Create the strategy; every per-config cache uses `ttl`.
    pub fn new(ttl: Duration, label: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Pinned::new(RoutingStrategyKind::ConfigBased.name(), ttl, label, clock),
        }
    }

    /// Routing key for `config`.
    pub fn routing_key(config: &ConfigMap) -> String {
        config.routing_key()
    }

    /// Id of the instance `config` is pinned to.
    pub fn pinned(&self, config: &ConfigMap) -> Option<u32> {
        self.inner.pinned_id(&config.routing_key())
    }
}

impl RoutingStrategy for ConfigBased {
    fn name(&self) -> &'static str {
        RoutingStrategyKind::ConfigBased.name()
    }

    fn kind(&self) -> RoutingStrategyKind {
        RoutingStrategyKind::ConfigBased
    }

    fn select(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError> {
        self.inner.select(candidates, routing_key)
    }

    fn remove(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError> {
        self.inner.remove(candidates, routing_key)
    }

    fn forget_instance(&mut self, id: u32) {
        self.inner.forget_instance(id);
    }

    fn check_cache(&mut self, metrics: &[Metric], routing_key: &str) -> (Vec<Metric>, Vec<Metric>) {
        self.inner.check_cache(metrics, routing_key)
    }

    fn update_cache(&mut self, metrics: &[Metric], routing_key: &str) {
        self.inner.update_cache(metrics, routing_key);
    }

    fn cache_hits(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError> {
        self.inner.cache_hits(namespace, version, routing_key)
    }

    fn cache_misses(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError> {
        self.inner.cache_misses(namespace, version, routing_key)
    }

    fn all_cache_hits(&self) -> u64 {
        self.inner.all_cache_hits()
    }

    fn all_cache_misses(&self) -> u64 {
        self.inner.all_cache_misses()
    }

    fn cache_ttl(&self, _routing_key: &str) -> Duration {
        self.inner.ttl()
    }
}
