//! # Routing strategies
//!
//! ## Responsibility
//! Decide which live instance of a plugin serves a request, and own the
//! metric cache(s) that let a request skip the plugin entirely.
//!
//! ## Variants
//!
//! | Strategy | Routing key | Cache | Selection |
//! |---|---|---|---|
//! | [`Lru`] | ignored | one per pool | earliest `last_hit` |
//! | [`Sticky`] | task id | one per task | pinned instance per task |
//! | [`ConfigBased`] | canonical config encoding | one per config | pinned instance per config |
//!
//! ## Guarantees
//! - Pinning strategies never pin one instance to two keys.
//! - A pinned key keeps its instance until [`RoutingStrategy::remove`] or
//!   [`RoutingStrategy::forget_instance`].
//!
//! ## NOT Responsible For
//! - Locking: callers hold the pool exclusively (`&mut self`)
//! - Growing or shrinking the pool (see `pool`)

pub mod config_based;
pub mod lru;
mod pinned;
pub mod sticky;

pub use config_based::ConfigBased;
pub use lru::Lru;
pub use sticky::Sticky;

use crate::cache::CacheError;
use crate::clock::Clock;
use crate::metric::Metric;
use crate::plugin::{PluginRef, RoutingStrategyKind};
use crate::pool::PoolError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Contract shared by every routing strategy.
pub trait RoutingStrategy: Send + Sync + fmt::Debug {
    /// Strategy name (`least-recently-used`, `sticky`, `config-based`).
    fn name(&self) -> &'static str;

    /// Strategy kind.
    fn kind(&self) -> RoutingStrategyKind;

    /// Pick an instance among `candidates` for `routing_key`.
    ///
    /// # Errors
    ///
    /// [`PoolError::CouldNotSelect`] if no candidate is eligible.
    fn select(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError>;

    /// Select, then forget any state held for `routing_key`.
    ///
    /// # Errors
    ///
    /// [`PoolError::CouldNotSelect`] if no candidate is eligible.
    fn remove(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError>;

    /// Drop every pin and per-key cache bound to instance `id`, which has
    /// left the pool.
    fn forget_instance(&mut self, id: u32);

    /// Split `metrics` into `(to_collect, from_cache)`.
    fn check_cache(&mut self, metrics: &[Metric], routing_key: &str) -> (Vec<Metric>, Vec<Metric>);

    /// Cache freshly collected `metrics`.
    fn update_cache(&mut self, metrics: &[Metric], routing_key: &str);

    /// Hits for one namespace/version in the cache for `routing_key`.
    ///
    /// # Errors
    ///
    /// [`CacheError`] if the cache or the entry does not exist.
    fn cache_hits(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError>;

    /// Misses for one namespace/version in the cache for `routing_key`.
    ///
    /// # Errors
    ///
    /// [`CacheError`] if the cache or the entry does not exist.
    fn cache_misses(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError>;

    /// Hits across every cache the strategy owns.
    fn all_cache_hits(&self) -> u64;

    /// Misses across every cache the strategy owns.
    fn all_cache_misses(&self) -> u64;

    /// TTL of the cache serving `routing_key`.
    fn cache_ttl(&self, routing_key: &str) -> Duration;
}

/// The active strategy of a pool.
#[derive(Debug)]
pub enum Strategy {
    /// Least-recently-used.
    Lru(Lru),
    /// Task-pinned.
    Sticky(Sticky),
    /// Configuration-pinned.
    ConfigBased(ConfigBased),
}

impl Strategy {
    /// Build the strategy a plugin declared.
    ///
    /// `label` names the owning pool in logs and metrics.
    ///
    /// # Errors
    ///
    /// [`PoolError::BadStrategy`] for an unrecognised preference.
    pub fn new(
        kind: RoutingStrategyKind,
        ttl: Duration,
        label: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        match kind {
            RoutingStrategyKind::LeastRecentlyUsed => Ok(Self::Lru(Lru::new(ttl, label, clock))),
            RoutingStrategyKind::Sticky => Ok(Self::Sticky(Sticky::new(ttl, label, clock))),
            RoutingStrategyKind::ConfigBased => {
                Ok(Self::ConfigBased(ConfigBased::new(ttl, label, clock)))
            }
            RoutingStrategyKind::Other(_) => Err(PoolError::BadStrategy(kind.to_string())),
        }
    }

    fn inner(&self) -> &dyn RoutingStrategy {
        match self {
            Self::Lru(s) => s,
            Self::Sticky(s) => s,
            Self::ConfigBased(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RoutingStrategy {
        match self {
            Self::Lru(s) => s,
            Self::Sticky(s) => s,
            Self::ConfigBased(s) => s,
        }
    }
}

impl RoutingStrategy for Strategy {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn kind(&self) -> RoutingStrategyKind {
        self.inner().kind()
    }

    fn select(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError> {
        self.inner_mut().select(candidates, routing_key)
    }

    fn remove(&mut self, candidates: &[PluginRef], routing_key: &str) -> Result<PluginRef, PoolError> {
        self.inner_mut().remove(candidates, routing_key)
    }

    fn forget_instance(&mut self, id: u32) {
        self.inner_mut().forget_instance(id);
    }

    fn check_cache(&mut self, metrics: &[Metric], routing_key: &str) -> (Vec<Metric>, Vec<Metric>) {
        self.inner_mut().check_cache(metrics, routing_key)
    }

    fn update_cache(&mut self, metrics: &[Metric], routing_key: &str) {
        self.inner_mut().update_cache(metrics, routing_key);
    }

    fn cache_hits(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError> {
        self.inner().cache_hits(namespace, version, routing_key)
    }

    fn cache_misses(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, CacheError> {
        self.inner().cache_misses(namespace, version, routing_key)
    }

    fn all_cache_hits(&self) -> u64 {
        self.inner().all_cache_hits()
    }

    fn all_cache_misses(&self) -> u64 {
        self.inner().all_cache_misses()
    }

    fn cache_ttl(&self, routing_key: &str) -> Duration {
        self.inner().cache_ttl(routing_key)
    }
}
