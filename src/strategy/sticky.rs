//! Sticky routing: one instance per task.
//!
//! The first selection for a task pins it to an instance no other task
//! holds; later selections return that instance without looking at the
//! candidates. Each task gets its own cache, so a task's cached metrics are
//! only ever touched through its own pinned instance.

use super::pinned::Pinned;
use super::RoutingStrategy;
use crate::cache::CacheError;
use crate::clock::Clock;
use crate::metric::Metric;
use crate::plugin::{PluginRef, RoutingStrategyKind};
use crate::pool::PoolError;
use std::sync::Arc;
use std::time::Duration;

/// Task-pinned strategy.
#[derive(Debug)]
pub struct Sticky {
    inner: Pinned,
}

impl Sticky {
    /// Create the strategy; every task cache uses `ttl`.
    pub fn new(ttl: Duration, label: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Pinned::new(RoutingStrategyKind::Sticky.name(), ttl, label, clock),
        }
    }

    /// Id of the instance `task_id` is pinned to.
    pub fn pinned(&self, task_id: &str) -> Option<u32> {
        self.inner.pinned_id(task_id)
    }

    /// Number of pinned tasks.
    pub fn pinned_count(&self) -> usize {
        self.inner.pin_count()
    }
}

impl RoutingStrategy for Sticky {
    fn name(&self) -> &'static str {
        RoutingStrategyKind::Sticky.name()
    }

    fn kind(&self) -> RoutingStrategyKind {
        RoutingStrategyKind::Sticky
    }

    fn select(&mut self, candidates: &[PluginRef], task_id: &str) -> Result<PluginRef, PoolError> {
        self.inner.select(candidates, task_id)
    }

    fn remove(&mut self, candidates: &[PluginRef], task_id: &str) -> Result<PluginRef, PoolError> {
        self.inner.remove(candidates, task_id)
    }

    fn forget_instance(&mut self, id: u32) {
        self.inner.forget_instance(id);
    }

    fn check_cache(&mut self, metrics: &[Metric], task_id: &str) -> (Vec<Metric>, Vec<Metric>) {
        self.inner.check_cache(metrics, task_id)
    }

    fn update_cache(&mut self, metrics: &[Metric], task_id: &str) {
        self.inner.update_cache(metrics, task_id);
    }

    fn cache_hits(&self, namespace: &str, version: i64, task_id: &str) -> Result<u64, CacheError> {
        self.inner.cache_hits(namespace, version, task_id)
    }

    fn cache_misses(&self, namespace: &str, version: i64, task_id: &str) -> Result<u64, CacheError> {
        self.inner.cache_misses(namespace, version, task_id)
    }

    fn all_cache_hits(&self) -> u64 {
        self.inner.all_cache_hits()
    }

    fn all_cache_misses(&self) -> u64 {
        self.inner.all_cache_misses()
    }

    fn cache_ttl(&self, _task_id: &str) -> Duration {
        self.inner.ttl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metric::Namespace;
    use crate::strategy::test_support::handles;

    fn sticky(clock: &Arc<ManualClock>) -> Sticky {
        Sticky::new(Duration::from_millis(500), "collector:mock:1", clock.clone())
    }

    #[test]
    fn test_same_task_gets_same_instance() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 3);
        let mut s = sticky(&clock);

        let first = s.select(&aps, "task-1").expect("select");
        let again = s.select(&aps[1..], "task-1").expect("select");
        assert_eq!(first.id(), again.id());
        assert_eq!(s.pinned("task-1"), Some(first.id()));
    }

    #[test]
    fn test_pinned_instance_returned_even_if_not_a_candidate() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 2);
        let mut s = sticky(&clock);
        let first = s.select(&aps, "task-1").expect("select");
        let again = s.select(&[], "task-1").expect("pin wins");
        assert_eq!(first.id(), again.id());
    }

    #[test]
    fn test_new_task_gets_unpinned_instance() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 2);
        let mut s = sticky(&clock);

        let a = s.select(&aps, "task-1").expect("select");
        let b = s.select(&aps, "task-2").expect("select");
        assert_ne!(a.id(), b.id());
        assert_eq!(s.pinned_count(), 2);
    }

    #[test]
    fn test_select_fails_when_every_candidate_is_pinned() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 1);
        let mut s = sticky(&clock);
        s.select(&aps, "task-1").expect("select");
        assert!(matches!(s.select(&aps, "task-2"), Err(PoolError::CouldNotSelect)));
    }

    #[test]
    fn test_remove_unpins_and_drops_cache() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 1);
        let mut s = sticky(&clock);
        s.select(&aps, "task-1").expect("select");
        let m = Metric::request(Namespace::from_strs(["a"]), 1).with_data(1);
        s.update_cache(&[m], "task-1");
        assert!(s.cache_misses("/a", 1, "task-1").is_ok());

        let removed = s.remove(&aps, "task-1").expect("remove");
        assert_eq!(removed.id(), aps[0].id());
        assert_eq!(s.pinned("task-1"), None);
        assert!(matches!(
            s.cache_hits("/a", 1, "task-1"),
            Err(CacheError::CacheDoesNotExist { .. })
        ));

        // the instance is free for another task now
        assert!(s.select(&aps, "task-2").is_ok());
    }

    #[test]
    fn test_forget_instance_unpins_every_key_it_served() {
        let clock = Arc::new(ManualClock::new());
        let aps = handles(&clock, 2);
        let mut s = sticky(&clock);
        let first = s.select(&aps, "task-1").expect("select");
        let other = s.select(&aps, "task-2").expect("select");
        let m = Metric::request(Namespace::from_strs(["a"]), 1).with_data(1);
        s.update_cache(&[m.clone()], "task-1");
        s.update_cache(&[m], "task-2");

        s.forget_instance(first.id());
        assert_eq!(s.pinned("task-1"), None);
        assert_eq!(s.pinned("task-2"), Some(other.id()));
        assert!(matches!(
            s.cache_hits("/a", 1, "task-1"),
            Err(CacheError::CacheDoesNotExist { .. })
        ));
        assert!(s.cache_hits("/a", 1, "task-2").is_ok());

        // unknown ids leave the pins alone
        s.forget_instance(99);
        assert_eq!(s.pinned_count(), 1);
    }

    #[test]
    fn test_caches_are_per_task() {
        let clock = Arc::new(ManualClock::new());
        let mut s = sticky(&clock);
        let m = Metric::request(Namespace::from_strs(["a"]), 1).with_data(1);
        s.update_cache(&[m.clone()], "task-1");

        let (to_collect, from_cache) = s.check_cache(&[m.clone()], "task-2");
        assert_eq!(to_collect.len(), 1);
        assert!(from_cache.is_empty());

        let (to_collect, from_cache) = s.check_cache(&[m], "task-1");
        assert!(to_collect.is_empty());
        assert_eq!(from_cache.len(), 1);

        assert_eq!(s.all_cache_hits(), 1);
        assert_eq!(s.all_cache_misses(), 1);
        assert_eq!(s.cache_hits("/a", 1, "task-1"), Ok(1));
        assert_eq!(s.cache_misses("/a", 1, "task-2"), Ok(1));
    }

    #[test]
    fn test_counters_for_unknown_task_fail() {
        let clock = Arc::new(ManualClock::new());
        let s = sticky(&clock);
        assert_eq!(
            s.cache_hits("/a", 1, "ghost"),
            Err(CacheError::CacheDoesNotExist { routing_key: "ghost".into() })
        );
    }
}
