//! Pinning core shared by the sticky and config-based strategies.
//!
//! Each pinned routing key owns one cache, created on its first lookup and
//! dropped with the pin or on a failed selection. An instance is pinned to
//! at most one key; eligibility is a linear scan over the existing pins,
//! which is fine at pool sizes of a handful of instances.

use crate::cache::{CacheError, MetricCache};
use crate::clock::Clock;
use crate::metric::Metric;
use crate::plugin::{AvailablePlugin, PluginRef};
use crate::pool::PoolError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct Pinned {
    strategy: &'static str,
    label: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    pins: HashMap<String, PluginRef>,
    caches: HashMap<String, MetricCache>,
}

impl Pinned {
    pub(crate) fn new(strategy: &'static str, ttl: Duration, label: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            strategy,
            label: label.to_string(),
            ttl,
            clock,
            pins: HashMap::new(),
            caches: HashMap::new(),
        }
    }

    /// Existing pin wins unconditionally, even if the pinned instance is
    /// missing from `candidates`.
    pub(crate) fn select(&mut self, candidates: &[PluginRef], key: &str) -> Result<PluginRef, PoolError> {
        if let Some(ap) = self.pins.get(key) {
            debug!(pool = %self.label, strategy = self.strategy, routing_key = key, plugin_id = ap.id(), "pinned plugin selected");
            return Ok(Arc::clone(ap));
        }

        for candidate in candidates {
            let taken = self.pins.values().any(|busy| busy.id() == candidate.id());
            if !taken {
                self.pins.insert(key.to_string(), Arc::clone(candidate));
                debug!(pool = %self.label, strategy = self.strategy, routing_key = key, plugin_id = candidate.id(), "plugin pinned");
                return Ok(Arc::clone(candidate));
            }
        }

        // An unpinned key owns no cache; drop the one a prior check_cache made.
        self.caches.remove(key);
        warn!(pool = %self.label, strategy = self.strategy, routing_key = key, candidates = candidates.len(), "unable to select plugin");
        Err(PoolError::CouldNotSelect)
    }

    pub(crate) fn remove(&mut self, candidates: &[PluginRef], key: &str) -> Result<PluginRef, PoolError> {
        let ap = self.select(candidates, key)?;
        self.pins.remove(key);
        self.caches.remove(key);
        Ok(ap)
    }

    pub(crate) fn forget_instance(&mut self, id: u32) {
        let keys: Vec<String> = self
            .pins
            .iter()
            .filter(|(_, ap)| ap.id() == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.pins.remove(&key);
            self.caches.remove(&key);
            debug!(pool = %self.label, strategy = self.strategy, routing_key = %key, plugin_id = id, "plugin unpinned");
        }
    }

    fn cache_mut(&mut self, key: &str) -> &mut MetricCache {
        let (ttl, label, clock) = (self.ttl, &self.label, &self.clock);
        self.caches
            .entry(key.to_string())
            .or_insert_with(|| MetricCache::new(ttl, label.as_str(), Arc::clone(clock)))
    }

    fn cache(&self, key: &str) -> Result<&MetricCache, CacheError> {
        self.caches.get(key).ok_or_else(|| CacheError::CacheDoesNotExist {
            routing_key: key.to_string(),
        })
    }

    pub(crate) fn check_cache(&mut self, metrics: &[Metric], key: &str) -> (Vec<Metric>, Vec<Metric>) {
        if metrics.is_empty() {
            return (Vec::new(), Vec::new());
        }
        self.cache_mut(key).check_cache(metrics)
    }

    pub(crate) fn update_cache(&mut self, metrics: &[Metric], key: &str) {
        self.cache_mut(key).update_cache(metrics);
    }

    pub(crate) fn cache_hits(&self, namespace: &str, version: i64, key: &str) -> Result<u64, CacheError> {
        self.cache(key)?.hits(namespace, version)
    }

    pub(crate) fn cache_misses(&self, namespace: &str, version: i64, key: &str) -> Result<u64, CacheError> {
        self.cache(key)?.misses(namespace, version)
    }

    pub(crate) fn all_cache_hits(&self) -> u64 {
        self.caches.values().map(MetricCache::all_hits).sum()
    }

    pub(crate) fn all_cache_misses(&self) -> u64 {
        self.caches.values().map(MetricCache::all_misses).sum()
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn pinned_id(&self, key: &str) -> Option<u32> {
        self.pins.get(key).map(|ap| ap.id())
    }

    pub(crate) fn pin_count(&self) -> usize {
        self.pins.len()
    }
}
