//! Least-recently-used routing.
//!
//! Every request goes to the instance whose last hit is the oldest; one
//! cache is shared by the whole pool. The strategy keeps no routing state,
//! so consecutive selections follow whatever hit times the instances carry.

use super::RoutingStrategy;
use crate::cache::{CacheError, MetricCache};
use crate::clock::Clock;
use crate::metric::Metric;
use crate::plugin::{AvailablePlugin, PluginRef, RoutingStrategyKind};
use crate::pool::PoolError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Least-recently-used strategy.
#[derive(Debug)]
pub struct Lru {
    label: String,
    cache: MetricCache,
}

impl Lru {
    /// Create the strategy with a pool-wide cache of `ttl`.
    pub fn new(ttl: Duration, label: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            label: label.to_string(),
            cache: MetricCache::new(ttl, label, clock),
        }
    }
}

impl RoutingStrategy for Lru {
    fn name(&self) -> &'static str {
        RoutingStrategyKind::LeastRecentlyUsed.name()
    }

    fn kind(&self) -> RoutingStrategyKind {
        RoutingStrategyKind::LeastRecentlyUsed
    }

    fn select(&mut self, candidates: &[PluginRef], _routing_key: &str) -> Result<PluginRef, PoolError> {
        // Strict `<` keeps the first candidate on ties.
        let mut chosen: Option<&PluginRef> = None;
        for candidate in candidates {
            match chosen {
                Some(best) if candidate.last_hit() >= best.last_hit() => {}
                _ => chosen = Some(candidate),
            }
        }

        match chosen {
            Some(ap) => {
                debug!(pool = %self.label, plugin_id = ap.id(), hits = ap.hit_count(), "plugin selected");
                Ok(Arc::clone(ap))
            }
            None => {
                warn!(pool = %self.label, candidates = candidates.len(), "unable to select plugin");
                Err(PoolError::CouldNotSelect)
            }
        }
    }

    fn remove(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError> {
        self.select(candidates, routing_key)
    }

    fn forget_instance(&mut self, _id: u32) {}

    fn check_cache(&mut self, metrics: &[Metric], _routing_key: &str) -> (Vec<Metric>, Vec<Metric>) {
        self.cache.check_cache(metrics)
    }

    fn update_cache(&mut self, metrics: &[Metric], _routing_key: &str) {
        self.cache.update_cache(metrics);
    }

    fn cache_hits(&self, namespace: &str, version: i64, _routing_key: &str) -> Result<u64, CacheError> {
        self.cache.hits(namespace, version)
    }

    fn cache_misses(&self, namespace: &str, version: i64, _routing_key: &str) -> Result<u64, CacheError> {
        self.cache.misses(namespace, version)
    }

    fn all_cache_hits(&self) -> u64 {
        self.cache.all_hits()
    }

    fn all_cache_misses(&self) -> u64 {
        self.cache.all_misses()
    }

    fn cache_ttl(&self, _routing_key: &str) -> Duration {
        self.cache.ttl()
    }
}
