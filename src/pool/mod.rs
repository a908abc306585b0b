//! # Plugin pool
//!
//! ## Responsibility
//! Own every live instance of one plugin version, the subscriptions of the
//! tasks consuming it, the elasticity signal ([`Pool::eligible`]) and the
//! routing strategy that picks an instance per request.
//!
//! ## Locking contract
//! `plugins`, `subs`, `max` and the restart count sit behind one internal
//! readers-writer lock, so subscription bookkeeping and counts work through
//! `&self`. Insertion, selection, kills and cache access take `&mut self`:
//! callers serialise them (the [`PoolRegistry`](crate::registry::PoolRegistry)
//! holds a per-pool lock for that) and keep the slow plugin call itself
//! outside any pool lock.
//!
//! ## Guarantees
//! - Instance ids are pool-local, increasing and never reused.
//! - Strategy, `max` and concurrency count are fixed by the first insert.
//! - Kill/stop failures never keep an instance in the pool.
//! - A removed instance takes its pins and their caches with it.
//!
//! ## NOT Responsible For
//! - Launching instances (the capacity manager acts on `eligible()`)
//! - Retrying failed selections

mod key;

pub use key::PoolKey;

use crate::cache::CacheError;
use crate::clock::{Clock, SystemClock};
use crate::config::PoolSettings;
use crate::config_data::ConfigMap;
use crate::metric::Metric;
use crate::metrics;
use crate::plugin::{AvailablePlugin, PluginRef, RoutingStrategyKind};
use crate::strategy::{RoutingStrategy, Strategy};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors surfaced by pools and routing strategies.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// No candidate instance was eligible for selection.
    #[error("could not select a plugin")]
    CouldNotSelect,

    /// An instance declared a plugin type pools do not manage.
    #[error("bad plugin type: {0}")]
    BadType(String),

    /// An instance declared (or a pool holds) an unknown routing strategy.
    #[error("bad routing strategy: {0}")]
    BadStrategy(String),

    /// The pool has no live instances.
    #[error("pool is empty")]
    PoolEmpty,

    /// The pool key is not `type:name:version`.
    #[error("bad pool key {key:?}: {reason}")]
    BadKey {
        /// The offending key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Cache introspection failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A task consuming a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Consuming task.
    pub task_id: String,
    /// Plugin version subscribed to.
    pub version: i64,
}

#[derive(Debug, Default)]
struct PoolState {
    plugins: BTreeMap<u32, PluginRef>,
    subs: HashMap<String, Subscription>,
    max: usize,
    restart_count: u64,
}

/// All live instances of one plugin version.
#[derive(Debug)]
pub struct Pool {
    key: String,
    version: i64,
    settings: PoolSettings,
    clock: Arc<dyn Clock>,
    pid_counter: AtomicU32,
    concurrency_count: usize,
    strategy: Option<Strategy>,
    state: RwLock<PoolState>,
}

impl Pool {
    /// Create an empty pool on the system clock.
    ///
    /// # Errors
    ///
    /// [`PoolError::BadKey`] if `key` is not `type:name:version`.
    pub fn new(key: &str, settings: PoolSettings) -> Result<Self, PoolError> {
        Self::with_clock(key, settings, Arc::new(SystemClock))
    }

    /// Create an empty pool driven by `clock`.
    ///
    /// `max` stays 0 until the first insert, so an empty, never-populated
    /// pool is not eligible for growth.
    ///
    /// # Errors
    ///
    /// [`PoolError::BadKey`] if `key` is not `type:name:version`.
    pub fn with_clock(key: &str, settings: PoolSettings, clock: Arc<dyn Clock>) -> Result<Self, PoolError> {
        let parsed: PoolKey = key.parse()?;
        Ok(Self {
            key: key.to_string(),
            version: parsed.version,
            settings,
            clock,
            pid_counter: AtomicU32::new(0),
            concurrency_count: 1,
            strategy: None,
            state: RwLock::new(PoolState::default()),
        })
    }

    /// Create a pool and insert `plugins` in order.
    ///
    /// # Errors
    ///
    /// Any error from [`Pool::with_clock`] or [`Pool::insert`].
    pub fn with_plugins(
        key: &str,
        settings: PoolSettings,
        clock: Arc<dyn Clock>,
        plugins: impl IntoIterator<Item = PluginRef>,
    ) -> Result<Self, PoolError> {
        let mut pool = Self::with_clock(key, settings, clock)?;
        for ap in plugins {
            pool.insert(ap)?;
        }
        Ok(pool)
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut PoolState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// `type:name:version` identity.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Plugin version served by this pool.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Clock the pool (and its caches) run on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Settings the pool was created with.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Ceiling on live instances (0 until the first insert).
    pub fn max(&self) -> usize {
        self.read().max
    }

    /// Subscriptions one instance serves before another is justified.
    pub fn concurrency_count(&self) -> usize {
        self.concurrency_count
    }

    /// Active strategy, once the first instance has been inserted.
    pub fn strategy(&self) -> Option<&Strategy> {
        self.strategy.as_ref()
    }

    /// Name of the active strategy.
    pub fn strategy_name(&self) -> Option<&'static str> {
        self.strategy.as_ref().map(RoutingStrategy::name)
    }

    /// Add a live instance.
    ///
    /// The first insert fixes `max` (1 for exclusive plugins), the
    /// concurrency count and the routing strategy from the instance's
    /// declared metadata.
    ///
    /// # Errors
    ///
    /// - [`PoolError::BadType`] for a type pools do not manage.
    /// - [`PoolError::BadStrategy`] for an unknown routing preference.
    pub fn insert(&mut self, ap: PluginRef) -> Result<(), PoolError> {
        if self.strategy.is_none() {
            Self::validate_plugin(ap.as_ref())?;
            self.apply_plugin_meta(ap.as_ref())?;
        } else if !ap.plugin_type().is_poolable() {
            return Err(PoolError::BadType(ap.plugin_type().to_string()));
        }

        let id = self.pid_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ap.set_id(id);
        let key = self.key.clone();
        let state = self.state_mut();
        state.plugins.insert(id, ap);
        let count = state.plugins.len();
        metrics::set_pool_instances(&key, count);
        debug!(pool = %key, plugin_id = id, instances = count, "plugin inserted");
        Ok(())
    }

    /// Check that `ap` could populate an empty pool: a managed type and a
    /// known routing strategy.
    ///
    /// # Errors
    ///
    /// - [`PoolError::BadType`] for a type pools do not manage.
    /// - [`PoolError::BadStrategy`] for an unknown routing preference.
    pub fn validate_plugin(ap: &dyn AvailablePlugin) -> Result<(), PoolError> {
        if !ap.plugin_type().is_poolable() {
            return Err(PoolError::BadType(ap.plugin_type().to_string()));
        }
        if let RoutingStrategyKind::Other(_) = ap.routing_strategy() {
            return Err(PoolError::BadStrategy(ap.routing_strategy().to_string()));
        }
        Ok(())
    }

    fn apply_plugin_meta(&mut self, ap: &dyn AvailablePlugin) -> Result<(), PoolError> {
        let ttl = self.settings.effective_cache_ttl(ap.cache_ttl());
        let strategy = Strategy::new(ap.routing_strategy(), ttl, &self.key, Arc::clone(&self.clock))?;
        let max = if ap.exclusive() {
            1
        } else {
            self.settings.max_running_plugins
        };

        info!(
            pool = %self.key,
            strategy = strategy.name(),
            max,
            concurrency_count = ap.concurrency_count(),
            cache_ttl_ms = ttl.as_millis() as u64,
            "pool configured from plugin metadata"
        );
        self.strategy = Some(strategy);
        self.concurrency_count = ap.concurrency_count();
        self.state_mut().max = max;
        Ok(())
    }

    /// Subscribe `task_id`; idempotent.
    pub fn subscribe(&self, task_id: &str) {
        let version = self.version;
        self.write()
            .subs
            .entry(task_id.to_string())
            .or_insert_with(|| Subscription {
                task_id: task_id.to_string(),
                version,
            });
    }

    /// Unsubscribe `task_id`; idempotent.
    pub fn unsubscribe(&self, task_id: &str) {
        self.write().subs.remove(task_id);
    }

    /// Whether one more instance should be launched: the pool is below its
    /// ceiling and carries more subscriptions than its instances can serve.
    pub fn eligible(&self) -> bool {
        let state = self.read();
        let instances = state.plugins.len();
        if instances >= state.max {
            return false;
        }
        state.subs.len() > self.concurrency_count.saturating_mul(instances)
    }

    /// Number of live instances.
    pub fn count(&self) -> usize {
        self.read().plugins.len()
    }

    /// Number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.read().subs.len()
    }

    /// Snapshot of the subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.read().subs.values().cloned().collect()
    }

    /// Live instances ordered by id.
    pub fn plugins(&self) -> Vec<PluginRef> {
        self.read().plugins.values().cloned().collect()
    }

    /// Move every subscription into `to`, re-versioned for that pool.
    /// Returns the moved subscriptions as they now exist in `to`.
    pub fn move_subscriptions(&self, to: &Pool) -> Vec<Subscription> {
        if std::ptr::eq(self, to) {
            return Vec::new();
        }
        let drained: Vec<Subscription> = self.write().subs.drain().map(|(_, s)| s).collect();
        let mut target = to.write();
        drained
            .into_iter()
            .map(|s| {
                let moved = Subscription {
                    task_id: s.task_id,
                    version: to.version,
                };
                target.subs.insert(moved.task_id.clone(), moved.clone());
                moved
            })
            .collect()
    }

    /// Record a forced restart.
    pub fn inc_restart_count(&self) {
        self.write().restart_count += 1;
        metrics::inc_restart(&self.key);
    }

    /// Forced restarts so far.
    pub fn restart_count(&self) -> u64 {
        self.read().restart_count
    }

    /// Whether the restart budget allows another restart.
    pub fn can_restart(&self) -> bool {
        self.restart_count() < self.settings.max_plugin_restarts
    }

    /// Routing key the active strategy uses for this task/config.
    ///
    /// # Errors
    ///
    /// - [`PoolError::CouldNotSelect`] if no strategy is active yet.
    /// - [`PoolError::BadStrategy`] for an unrecognised active strategy.
    pub fn routing_key(&self, task_id: &str, config: &ConfigMap) -> Result<String, PoolError> {
        let strategy = self.strategy.as_ref().ok_or(PoolError::CouldNotSelect)?;
        match strategy.kind() {
            RoutingStrategyKind::LeastRecentlyUsed => Ok(String::new()),
            RoutingStrategyKind::Sticky => Ok(task_id.to_string()),
            RoutingStrategyKind::ConfigBased => Ok(config.routing_key()),
            other => Err(PoolError::BadStrategy(other.to_string())),
        }
    }

    /// Select the instance that serves `task_id` with `config`.
    ///
    /// # Errors
    ///
    /// - [`PoolError::CouldNotSelect`] if no instance is eligible.
    /// - [`PoolError::BadStrategy`] for an unrecognised active strategy.
    pub fn select_ap(&mut self, task_id: &str, config: &ConfigMap) -> Result<PluginRef, PoolError> {
        let routing_key = self.routing_key(task_id, config)?;
        let candidates = self.plugins();
        let key = self.key.clone();
        let strategy = self.strategy.as_mut().ok_or(PoolError::CouldNotSelect)?;
        match strategy.select(&candidates, &routing_key) {
            Ok(ap) => {
                metrics::inc_selection(&key, strategy.name());
                Ok(ap)
            }
            Err(e) => {
                metrics::inc_selection_failure(&key, strategy.name());
                Err(e)
            }
        }
    }

    fn select_for_removal(&mut self, task_id: &str, config: &ConfigMap) -> Result<PluginRef, PoolError> {
        let routing_key = self.routing_key(task_id, config)?;
        let candidates = self.plugins();
        let strategy = self.strategy.as_mut().ok_or(PoolError::CouldNotSelect)?;
        strategy.remove(&candidates, &routing_key)
    }

    /// Select the instance serving `task_id`, ask it to stop and remove it.
    ///
    /// A failed stop is logged; the instance leaves the pool regardless.
    ///
    /// # Errors
    ///
    /// Selection errors as for [`Pool::select_ap`].
    pub fn select_and_stop(&mut self, task_id: &str, config: &ConfigMap, reason: &str) -> Result<PluginRef, PoolError> {
        let ap = self.select_for_removal(task_id, config)?;
        if let Err(e) = ap.stop(reason) {
            error!(pool = %self.key, plugin_id = ap.id(), error = %e, "unable to stop plugin");
        }
        self.remove(ap.id());
        Ok(ap)
    }

    /// Select the instance serving `task_id`, kill it and remove it.
    ///
    /// A failed kill is logged; the instance leaves the pool regardless.
    ///
    /// # Errors
    ///
    /// Selection errors as for [`Pool::select_ap`].
    pub fn select_and_kill(&mut self, task_id: &str, config: &ConfigMap, reason: &str) -> Result<PluginRef, PoolError> {
        let ap = self.select_for_removal(task_id, config)?;
        if let Err(e) = ap.kill(reason) {
            error!(pool = %self.key, plugin_id = ap.id(), error = %e, "unable to kill plugin");
        }
        self.remove(ap.id());
        Ok(ap)
    }

    fn remove(&mut self, id: u32) -> Option<PluginRef> {
        let key = self.key.clone();
        let state = self.state_mut();
        let removed = state.plugins.remove(&id);
        metrics::set_pool_instances(&key, state.plugins.len());
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.forget_instance(id);
        }
        removed
    }

    /// Kill instance `id` and remove it; unknown ids are ignored.
    ///
    /// Tasks or configurations pinned to it are re-pinned on their next
    /// selection.
    pub fn kill(&mut self, id: u32, reason: &str) {
        let Some(ap) = self.remove(id) else {
            return;
        };
        if let Err(e) = ap.kill(reason) {
            error!(pool = %self.key, plugin_id = id, error = %e, "unable to kill plugin");
        }
        debug!(pool = %self.key, plugin_id = id, reason, "plugin killed");
    }

    /// Kill and remove every instance.
    pub fn kill_all(&mut self, reason: &str) {
        let ids: Vec<u32> = self.read().plugins.keys().copied().collect();
        for id in ids {
            self.kill(id, reason);
        }
    }

    /// TTL of the cache serving `task_id` with `config`.
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolEmpty`] if the pool has no live instances.
    /// - [`PoolError::BadStrategy`] for an unrecognised active strategy.
    pub fn cache_ttl(&self, task_id: &str, config: &ConfigMap) -> Result<Duration, PoolError> {
        if self.count() == 0 {
            return Err(PoolError::PoolEmpty);
        }
        let routing_key = self.routing_key(task_id, config)?;
        let strategy = self.strategy.as_ref().ok_or(PoolError::PoolEmpty)?;
        Ok(strategy.cache_ttl(&routing_key))
    }

    /// Split `metrics` into `(to_collect, from_cache)` for `routing_key`.
    /// Before the first insert nothing is cached.
    pub fn check_cache(&mut self, metrics: &[Metric], routing_key: &str) -> (Vec<Metric>, Vec<Metric>) {
        match self.strategy.as_mut() {
            Some(s) => s.check_cache(metrics, routing_key),
            None => (metrics.to_vec(), Vec::new()),
        }
    }

    /// Cache freshly collected `metrics` for `routing_key`.
    pub fn update_cache(&mut self, metrics: &[Metric], routing_key: &str) {
        match self.strategy.as_mut() {
            Some(s) => s.update_cache(metrics, routing_key),
            None => warn!(pool = %self.key, "update_cache on a pool without strategy"),
        }
    }

    /// Hits for one namespace/version under `routing_key`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Cache`] if the cache or entry does not exist.
    pub fn cache_hits(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, PoolError> {
        Ok(self.strategy_or_missing(routing_key)?.cache_hits(namespace, version, routing_key)?)
    }

    /// Misses for one namespace/version under `routing_key`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Cache`] if the cache or entry does not exist.
    pub fn cache_misses(&self, namespace: &str, version: i64, routing_key: &str) -> Result<u64, PoolError> {
        Ok(self.strategy_or_missing(routing_key)?.cache_misses(namespace, version, routing_key)?)
    }

    /// Hits across all of the pool's caches.
    pub fn all_cache_hits(&self) -> u64 {
        self.strategy.as_ref().map_or(0, RoutingStrategy::all_cache_hits)
    }

    /// Misses across all of the pool's caches.
    pub fn all_cache_misses(&self) -> u64 {
        self.strategy.as_ref().map_or(0, RoutingStrategy::all_cache_misses)
    }

    fn strategy_or_missing(&self, routing_key: &str) -> Result<&Strategy, CacheError> {
        self.strategy.as_ref().ok_or_else(|| CacheError::CacheDoesNotExist {
            routing_key: routing_key.to_string(),
        })
    }
}
