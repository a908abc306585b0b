//! # PoolRegistry: capacity manager and collection invoker
//!
//! ## Responsibility
//! Hold every pool by its `type:name:version` key, route subscriptions and
//! newly started instances to the right pool, report which pools want
//! another instance, and run the cache-aware collection cycle.
//!
//! ## Guarantees
//! - Each pool sits behind a `tokio::sync::RwLock`. The write half is the
//!   external serialisation pools require for insert, selection, kills and
//!   cache access; subscription bookkeeping only needs the read half.
//! - A rejected plugin never leaves an empty pool behind.
//! - No pool lock is held while a plugin's `collect` call is in flight.
//! - Restart budgets are enforced per pool.
//!
//! ## NOT Responsible For
//! - Launching worker processes (callers act on [`PoolRegistry::eligible_pools`])
//! - Timeouts on `collect` (wrap the call in `tokio::time::timeout`)

use crate::clock::{Clock, SystemClock};
use crate::config::{PoolSettings, RuntimeConfig};
use crate::config_data::ConfigMap;
use crate::metric::Metric;
use crate::plugin::{AvailablePlugin, PluginRef};
use crate::pool::Pool;
use crate::RuntimeError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Shared handle to one pool.
pub type PoolHandle = Arc<RwLock<Pool>>;

/// All pools of a process, keyed by `type:name:version`.
///
/// # Example
///
/// ```rust
/// use telemetry_plugin_pool::config::PoolSettings;
/// use telemetry_plugin_pool::registry::PoolRegistry;
///
/// # async fn example() -> Result<(), telemetry_plugin_pool::RuntimeError> {
/// let registry = PoolRegistry::new(PoolSettings::default());
/// registry.subscribe("collector:cpu:1", "task-1").await?;
/// assert_eq!(registry.pool_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PoolRegistry {
    pools: DashMap<String, PoolHandle>,
    settings: PoolSettings,
    clock: Arc<dyn Clock>,
}

impl PoolRegistry {
    /// Empty registry on the system clock.
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Empty registry from a loaded [`RuntimeConfig`].
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.pool.clone())
    }

    /// Empty registry whose pools, caches and hit tracking use `clock`.
    pub fn with_clock(settings: PoolSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
            clock,
        }
    }

    /// Number of pools.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sorted keys of every pool.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Pool for `key`, if one exists.
    pub fn get(&self, key: &str) -> Option<PoolHandle> {
        self.pools.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Pool for `key`, created empty if missing.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Pool`] if `key` is not `type:name:version`.
    pub fn get_or_create(&self, key: &str) -> Result<PoolHandle, RuntimeError> {
        if let Some(handle) = self.get(key) {
            return Ok(handle);
        }
        let pool = Pool::with_clock(key, self.settings.clone(), Arc::clone(&self.clock))?;
        let entry = self
            .pools
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(pool)));
        debug!(pool = key, "pool registered");
        Ok(Arc::clone(entry.value()))
    }

    fn require(&self, key: &str) -> Result<PoolHandle, RuntimeError> {
        self.get(key)
            .ok_or_else(|| RuntimeError::PoolNotFound(key.to_string()))
    }

    /// Add a newly started instance to the pool its metadata names.
    /// Returns that pool's key.
    ///
    /// A plugin that could not populate a new pool is rejected before the
    /// pool is registered.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Pool`] for a malformed key, an unmanaged plugin type
    /// or an unknown routing strategy.
    pub async fn insert_plugin(&self, ap: PluginRef) -> Result<String, RuntimeError> {
        let key = format!("{}:{}:{}", ap.plugin_type(), ap.name(), ap.version());
        if self.get(&key).is_none() {
            if let Err(e) = Pool::validate_plugin(ap.as_ref()) {
                warn!(pool = %key, error = %e, "plugin rejected");
                return Err(e.into());
            }
        }
        let handle = self.get_or_create(&key)?;
        handle.write().await.insert(ap)?;
        Ok(key)
    }

    /// Subscribe `task_id` to the pool for `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Pool`] if `key` is malformed.
    pub async fn subscribe(&self, key: &str, task_id: &str) -> Result<(), RuntimeError> {
        let handle = self.get_or_create(key)?;
        handle.read().await.subscribe(task_id);
        debug!(pool = key, task_id, "task subscribed");
        Ok(())
    }

    /// Unsubscribe `task_id` from the pool for `key`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::PoolNotFound`] if no such pool exists.
    pub async fn unsubscribe(&self, key: &str, task_id: &str) -> Result<(), RuntimeError> {
        let handle = self.require(key)?;
        handle.read().await.unsubscribe(task_id);
        debug!(pool = key, task_id, "task unsubscribed");
        Ok(())
    }

    /// Sorted keys of the pools that want one more instance.
    pub async fn eligible_pools(&self) -> Vec<String> {
        let mut eligible = Vec::new();
        for (key, handle) in self.snapshot() {
            if handle.read().await.eligible() {
                eligible.push(key);
            }
        }
        eligible.sort();
        eligible
    }

    // DashMap guards must not live across an await.
    fn snapshot(&self) -> Vec<(String, PoolHandle)> {
        self.pools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Drop the pool for `key`, killing its instances.
    pub async fn remove_pool(&self, key: &str, reason: &str) -> Option<PoolHandle> {
        let (_, handle) = self.pools.remove(key)?;
        handle.write().await.kill_all(reason);
        info!(pool = key, reason, "pool removed");
        Some(handle)
    }

    /// Kill every instance of every pool. Pools and subscriptions remain.
    pub async fn kill_all(&self, reason: &str) {
        for (_, handle) in self.snapshot() {
            handle.write().await.kill_all(reason);
        }
    }

    /// React to instance `id` of pool `key` dying: remove it (with any
    /// pins it held) and, if the pool's restart budget allows, count a
    /// restart.
    ///
    /// Returns whether the caller should start a replacement.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::PoolNotFound`] if no such pool exists.
    pub async fn handle_plugin_death(&self, key: &str, id: u32) -> Result<bool, RuntimeError> {
        let handle = self.require(key)?;
        let mut pool = handle.write().await;
        pool.kill(id, "plugin died");
        if !pool.can_restart() {
            warn!(pool = key, plugin_id = id, restarts = pool.restart_count(), "restart budget exhausted");
            return Ok(false);
        }
        pool.inc_restart_count();
        info!(pool = key, plugin_id = id, restarts = pool.restart_count(), "plugin restart scheduled");
        Ok(true)
    }

    /// Collect `metrics` for `task_id` through the pool for `key`.
    ///
    /// Fresh cached values are served without touching a plugin. The rest
    /// are collected from the instance the pool's strategy selects, with no
    /// pool lock held during the call, then cached.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::PoolNotFound`] if no such pool exists.
    /// - [`RuntimeError::Pool`] if no instance can be selected.
    /// - [`RuntimeError::Plugin`] if the collection call fails.
    pub async fn collect_metrics(
        &self,
        key: &str,
        task_id: &str,
        metrics: &[Metric],
        config: &ConfigMap,
    ) -> Result<Vec<Metric>, RuntimeError> {
        let handle = self.require(key)?;

        let (ap, routing_key, to_collect, mut out) = {
            let mut pool = handle.write().await;
            let routing_key = pool.routing_key(task_id, config)?;
            let (to_collect, from_cache) = pool.check_cache(metrics, &routing_key);
            if to_collect.is_empty() {
                debug!(pool = key, task_id, served = from_cache.len(), "all metrics served from cache");
                return Ok(from_cache);
            }
            let ap = pool.select_ap(task_id, config)?;
            (ap, routing_key, to_collect, from_cache)
        };

        let collected = ap.collect(&to_collect, config).await?;
        ap.record_hit(self.clock.now());
        debug!(
            pool = key,
            task_id,
            plugin_id = ap.id(),
            collected = collected.len(),
            cached = out.len(),
            "metrics collected"
        );

        handle.write().await.update_cache(&collected, &routing_key);
        out.extend(collected);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::clock::ManualClock;
    use crate::metric::Namespace;
    use crate::plugin::{EchoClient, PluginHandle, PluginMeta, PluginType, RoutingStrategyKind};
    use crate::pool::PoolError;
    use std::time::Duration;

    const KEY: &str = "collector:mock:1";

    fn registry() -> (PoolRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (PoolRegistry::with_clock(PoolSettings::default(), clock.clone()), clock)
    }

    fn plugin(clock: &ManualClock, meta: PluginMeta) -> (PluginRef, Arc<EchoClient>) {
        let client = Arc::new(EchoClient::new());
        (Arc::new(PluginHandle::new(meta, client.clone(), clock)), client)
    }

    fn mock_meta() -> PluginMeta {
        PluginMeta::new("mock", 1, PluginType::Collector)
    }

    fn request(part: &str) -> Metric {
        Metric::request(Namespace::from_strs(["intel", part]), 1)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (reg, _) = registry();
        let a = reg.get_or_create(KEY).expect("create");
        let b = reg.get_or_create(KEY).expect("get");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.pool_count(), 1);
        assert!(matches!(
            reg.get_or_create("bad"),
            Err(RuntimeError::Pool(PoolError::BadKey { .. }))
        ));
    }

    #[tokio::test]
    async fn test_insert_plugin_routes_by_metadata() {
        let (reg, clock) = registry();
        let (ap, _) = plugin(&clock, mock_meta());
        let key = reg.insert_plugin(ap).await.expect("insert");
        assert_eq!(key, KEY);
        let handle = reg.get(KEY).expect("pool exists");
        assert_eq!(handle.read().await.count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_plugin_registers_no_pool() {
        let (reg, clock) = registry();
        let (tap, _) = plugin(&clock, PluginMeta::new("mock", 1, PluginType::from("tap")));
        assert!(matches!(
            reg.insert_plugin(tap).await,
            Err(RuntimeError::Pool(PoolError::BadType(_)))
        ));

        let mut meta = mock_meta();
        meta.routing_strategy = RoutingStrategyKind::Other(9);
        assert!(matches!(
            reg.insert_plugin(plugin(&clock, meta).0).await,
            Err(RuntimeError::Pool(PoolError::BadStrategy(_)))
        ));

        assert_eq!(reg.pool_count(), 0);
        assert!(reg.keys().is_empty());
        assert!(reg.eligible_pools().await.is_empty());
    }

    #[tokio::test]
    async fn test_eligible_pools_follows_subscriptions() {
        let (reg, clock) = registry();
        let mut meta = mock_meta();
        meta.concurrency_count = 1;
        reg.insert_plugin(plugin(&clock, meta).0).await.expect("insert");
        reg.subscribe(KEY, "t1").await.expect("subscribe");
        assert!(reg.eligible_pools().await.is_empty());

        reg.subscribe(KEY, "t2").await.expect("subscribe");
        assert_eq!(reg.eligible_pools().await, vec![KEY.to_string()]);

        reg.unsubscribe(KEY, "t2").await.expect("unsubscribe");
        assert!(reg.eligible_pools().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_pool() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.unsubscribe(KEY, "t1").await,
            Err(RuntimeError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_serves_second_call_from_cache() {
        let (reg, clock) = registry();
        let (ap, client) = plugin(&clock, mock_meta());
        reg.insert_plugin(ap.clone()).await.expect("insert");

        let req = [request("cpu"), request("mem")];
        let first = reg
            .collect_metrics(KEY, "t1", &req, &ConfigMap::new())
            .await
            .expect("collect");
        assert_eq!(first.len(), 2);
        assert_eq!(client.collect_count(), 1);
        assert_eq!(ap.hit_count(), 1);

        let second = reg
            .collect_metrics(KEY, "t1", &req, &ConfigMap::new())
            .await
            .expect("collect");
        assert_eq!(second, first);
        assert_eq!(client.collect_count(), 1, "served from cache");

        clock.advance(Duration::from_millis(500));
        let third = reg
            .collect_metrics(KEY, "t1", &req, &ConfigMap::new())
            .await
            .expect("collect");
        assert_eq!(client.collect_count(), 2, "expired entries are recollected");
        assert!(third.iter().all(|m| m.data == serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_collect_records_hit_time_from_clock() {
        let (reg, clock) = registry();
        let (ap, _) = plugin(&clock, mock_meta());
        reg.insert_plugin(ap.clone()).await.expect("insert");
        clock.advance(Duration::from_secs(3));
        reg.collect_metrics(KEY, "t1", &[request("cpu")], &ConfigMap::new())
            .await
            .expect("collect");
        assert_eq!(ap.last_hit(), clock.base() + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_collect_without_instances_fails() {
        let (reg, _) = registry();
        reg.subscribe(KEY, "t1").await.expect("subscribe");
        assert!(matches!(
            reg.collect_metrics(KEY, "t1", &[request("cpu")], &ConfigMap::new()).await,
            Err(RuntimeError::Pool(PoolError::CouldNotSelect))
        ));
        assert!(matches!(
            reg.collect_metrics("collector:none:1", "t1", &[], &ConfigMap::new()).await,
            Err(RuntimeError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sticky_tasks_use_their_own_instance_and_cache() {
        let (reg, clock) = registry();
        let mut meta = mock_meta();
        meta.routing_strategy = RoutingStrategyKind::Sticky;
        let (a, a_client) = plugin(&clock, meta.clone());
        let (b, b_client) = plugin(&clock, meta);
        reg.insert_plugin(a).await.expect("insert");
        reg.insert_plugin(b).await.expect("insert");

        let req = [request("cpu")];
        let cfg = ConfigMap::new();
        reg.collect_metrics(KEY, "t1", &req, &cfg).await.expect("collect");
        reg.collect_metrics(KEY, "t2", &req, &cfg).await.expect("collect");
        assert_eq!(a_client.collect_count(), 1);
        assert_eq!(b_client.collect_count(), 1);

        reg.collect_metrics(KEY, "t1", &req, &cfg).await.expect("collect");
        assert_eq!(a_client.collect_count() + b_client.collect_count(), 2);
    }

    #[tokio::test]
    async fn test_replacement_serves_task_of_dead_sticky_instance() {
        let (reg, clock) = registry();
        let mut meta = mock_meta();
        meta.routing_strategy = RoutingStrategyKind::Sticky;
        let (dead, dead_client) = plugin(&clock, meta.clone());
        reg.insert_plugin(dead.clone()).await.expect("insert");

        let req = [request("cpu")];
        let cfg = ConfigMap::new();
        reg.collect_metrics(KEY, "t1", &req, &cfg).await.expect("collect");
        assert_eq!(dead_client.collect_count(), 1);

        assert_eq!(reg.handle_plugin_death(KEY, dead.id()).await.ok(), Some(true));
        let (replacement, replacement_client) = plugin(&clock, meta);
        reg.insert_plugin(replacement).await.expect("insert");

        clock.advance(Duration::from_millis(500));
        reg.collect_metrics(KEY, "t1", &req, &cfg).await.expect("collect");
        assert_eq!(dead_client.collect_count(), 1, "dead instance must not serve");
        assert_eq!(replacement_client.collect_count(), 1);
    }

    #[tokio::test]
    async fn test_unpinnable_config_leaves_no_cache() {
        let (reg, clock) = registry();
        let mut meta = mock_meta();
        meta.routing_strategy = RoutingStrategyKind::ConfigBased;
        reg.insert_plugin(plugin(&clock, meta).0).await.expect("insert");

        let req = [request("cpu")];
        let a = ConfigMap::new().with("user", "admin");
        reg.collect_metrics(KEY, "t1", &req, &a).await.expect("collect");

        let b = ConfigMap::new().with("user", "guest");
        assert!(matches!(
            reg.collect_metrics(KEY, "t2", &req, &b).await,
            Err(RuntimeError::Pool(PoolError::CouldNotSelect))
        ));

        let handle = reg.get(KEY).expect("pool");
        let pool = handle.read().await;
        let b_key = pool.routing_key("t2", &b).expect("routing key");
        assert!(matches!(
            pool.cache_hits("/intel/cpu", 1, &b_key),
            Err(PoolError::Cache(CacheError::CacheDoesNotExist { .. }))
        ));
        assert_eq!(pool.all_cache_misses(), 1, "only the pinned config's miss");
    }

    #[tokio::test]
    async fn test_handle_plugin_death_respects_restart_budget() {
        let (reg, clock) = registry();
        for _ in 0..4 {
            reg.insert_plugin(plugin(&clock, mock_meta()).0).await.expect("insert");
        }
        assert_eq!(reg.handle_plugin_death(KEY, 1).await.ok(), Some(true));
        assert_eq!(reg.handle_plugin_death(KEY, 2).await.ok(), Some(true));
        assert_eq!(reg.handle_plugin_death(KEY, 3).await.ok(), Some(true));
        assert_eq!(reg.handle_plugin_death(KEY, 4).await.ok(), Some(false));

        let handle = reg.get(KEY).expect("pool");
        let pool = handle.read().await;
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.restart_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_pool_kills_instances() {
        let (reg, clock) = registry();
        let (ap, client) = plugin(&clock, mock_meta());
        reg.insert_plugin(ap).await.expect("insert");
        assert!(reg.remove_pool(KEY, "unloaded").await.is_some());
        assert!(client.is_killed());
        assert_eq!(reg.pool_count(), 0);
        assert!(reg.remove_pool(KEY, "again").await.is_none());
    }

    #[tokio::test]
    async fn test_kill_all_keeps_pools_and_subscriptions() {
        let (reg, clock) = registry();
        let (ap, client) = plugin(&clock, mock_meta());
        reg.insert_plugin(ap).await.expect("insert");
        reg.subscribe(KEY, "t1").await.expect("subscribe");
        reg.kill_all("shutdown").await;
        assert!(client.is_killed());
        let handle = reg.get(KEY).expect("pool");
        let pool = handle.read().await;
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.subscription_count(), 1);
        assert_eq!(reg.keys(), vec![KEY.to_string()]);
    }
}
