//! Metric cache.
//!
//! ## Responsibility
//! Remember the most recently collected value(s) per `(namespace, version)`
//! for a bounded time so repeated collections can skip the plugin.
//!
//! ## Guarantees
//! - A cell older than the TTL (`now - time >= ttl`) reads exactly like a
//!   missing one, but is not evicted; the next `put` overwrites it.
//! - Hit/miss counters only grow and survive overwrites.
//! - The first miss on an unknown key creates a (valueless) cell, so it is
//!   visible to [`MetricCache::misses`].
//! - Metrics with dynamic namespace positions are cached as one group under
//!   their wildcarded namespace.
//!
//! ## NOT Responsible For
//! - Locking: callers serialise access (`&mut self`)
//! - Size bounding: cells are keyed per namespace a plugin exposes

use crate::clock::Clock;
use crate::metric::Metric;
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Errors from cache introspection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No cell was ever created for the namespace/version.
    #[error("cache entry does not exist: {key}")]
    EntryDoesNotExist {
        /// The `namespace:version` key that was looked up.
        key: String,
    },

    /// No cache exists for the routing key.
    #[error("cache does not exist for routing key {routing_key:?}")]
    CacheDoesNotExist {
        /// The routing key that was looked up.
        routing_key: String,
    },
}

/// What a cell stores: one metric, or the group sharing a wildcard namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// A single concrete metric.
    Single(Metric),
    /// Every metric matching a dynamic namespace.
    Multiple(Vec<Metric>),
}

impl CacheValue {
    /// Flatten into individual metrics.
    pub fn into_metrics(self) -> Vec<Metric> {
        match self {
            Self::Single(m) => vec![m],
            Self::Multiple(ms) => ms,
        }
    }
}

/// One cache slot.
#[derive(Debug, Clone)]
pub struct CacheCell {
    time: Instant,
    value: Option<CacheValue>,
    hits: u64,
    misses: u64,
}

impl CacheCell {
    /// Successful lookups so far.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Failed lookups so far.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// Compose the cell key for a namespace string and version.
pub fn cache_key(namespace: &str, version: i64) -> String {
    format!("{namespace}:{version}")
}

/// TTL-bounded store of collected metrics with hit/miss accounting.
#[derive(Debug)]
pub struct MetricCache {
    ttl: Duration,
    label: String,
    clock: Arc<dyn Clock>,
    table: HashMap<String, CacheCell>,
}

impl MetricCache {
    /// Create an empty cache.
    ///
    /// `label` names the owner (usually the pool key) in metrics and logs.
    pub fn new(ttl: Duration, label: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            label: label.into(),
            clock,
            table: HashMap::new(),
        }
    }

    /// Configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of cells, including valueless ones created by misses.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no cell exists.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Look up a fresh value.
    ///
    /// Counts a hit when a non-expired value is present; otherwise counts a
    /// miss (creating the cell if needed) and returns `None`.
    pub fn get(&mut self, namespace: &str, version: i64) -> Option<CacheValue> {
        let key = cache_key(namespace, version);
        let now = self.clock.now();
        let ttl = self.ttl;
        let cell = self.table.entry(key).or_insert_with(|| CacheCell {
            time: now,
            value: None,
            hits: 0,
            misses: 0,
        });

        let fresh = now.saturating_duration_since(cell.time) < ttl;
        match (&cell.value, fresh) {
            (Some(value), true) => {
                cell.hits += 1;
                metrics::inc_cache_hit(&self.label);
                debug!(pool = %self.label, namespace, version, "cache hit");
                Some(value.clone())
            }
            _ => {
                cell.misses += 1;
                metrics::inc_cache_miss(&self.label);
                debug!(pool = %self.label, namespace, version, "cache miss");
                None
            }
        }
    }

    /// Store a value, refreshing the cell's timestamp.
    ///
    /// An empty group is not a storable payload: it is logged and dropped.
    pub fn put(&mut self, namespace: &str, version: i64, value: CacheValue) {
        if matches!(&value, CacheValue::Multiple(group) if group.is_empty()) {
            error!(
                pool = %self.label,
                namespace,
                version,
                "unsupported cache payload: empty metric group"
            );
            return;
        }

        let now = self.clock.now();
        let cell = self
            .table
            .entry(cache_key(namespace, version))
            .or_insert_with(|| CacheCell {
                time: now,
                value: None,
                hits: 0,
                misses: 0,
            });
        cell.time = now;
        cell.value = Some(value);
    }

    /// Split requested metrics into those that must be collected and those
    /// served from cache. Group cells expand into their members.
    pub fn check_cache(&mut self, requested: &[Metric]) -> (Vec<Metric>, Vec<Metric>) {
        let mut to_collect = Vec::new();
        let mut from_cache = Vec::new();
        for mt in requested {
            match self.get(&mt.namespace().to_string(), mt.version()) {
                Some(value) => from_cache.extend(value.into_metrics()),
                None => to_collect.push(mt.clone()),
            }
        }
        (to_collect, from_cache)
    }

    /// Cache freshly collected metrics.
    ///
    /// Static namespaces are cached individually; metrics with dynamic
    /// positions are grouped under their wildcarded namespace.
    pub fn update_cache(&mut self, collected: &[Metric]) {
        // Vec keeps group insertion order stable.
        let mut groups: Vec<(String, Vec<Metric>)> = Vec::new();
        for mt in collected {
            let (dynamic, _) = mt.namespace().is_dynamic();
            if !dynamic {
                self.put(
                    &mt.namespace().to_string(),
                    mt.version(),
                    CacheValue::Single(mt.clone()),
                );
                continue;
            }
            let key = mt.namespace().wildcarded().to_string();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(mt.clone()),
                None => groups.push((key, vec![mt.clone()])),
            }
        }

        for (namespace, group) in groups {
            let version = group.first().map_or(0, Metric::version);
            self.put(&namespace, version, CacheValue::Multiple(group));
        }
    }

    /// Hits recorded for one namespace/version.
    pub fn hits(&self, namespace: &str, version: i64) -> Result<u64, CacheError> {
        self.cell(namespace, version).map(CacheCell::hits)
    }

    /// Misses recorded for one namespace/version.
    pub fn misses(&self, namespace: &str, version: i64) -> Result<u64, CacheError> {
        self.cell(namespace, version).map(CacheCell::misses)
    }

    /// Hits across every cell.
    pub fn all_hits(&self) -> u64 {
        self.table.values().map(CacheCell::hits).sum()
    }

    /// Misses across every cell.
    pub fn all_misses(&self) -> u64 {
        self.table.values().map(CacheCell::misses).sum()
    }

    fn cell(&self, namespace: &str, version: i64) -> Result<&CacheCell, CacheError> {
        let key = cache_key(namespace, version);
        self.table
            .get(&key)
            .ok_or(CacheError::EntryDoesNotExist { key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metric::{Metric, Namespace};

    const TTL: Duration = Duration::from_millis(500);

    fn cache() -> (MetricCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MetricCache::new(TTL, "collector:mock:1", clock.clone()), clock)
    }

    fn metric(parts: &[&str], data: i64) -> Metric {
        Metric::request(Namespace::from_strs(parts.iter().copied()), 1).with_data(data)
    }

    #[test]
    fn test_put_then_get_returns_value() {
        let (mut c, _) = cache();
        let m = metric(&["intel", "mock", "foo"], 1);
        c.put("/intel/mock/foo", 1, CacheValue::Single(m.clone()));
        assert_eq!(c.get("/intel/mock/foo", 1), Some(CacheValue::Single(m)));
        assert_eq!(c.hits("/intel/mock/foo", 1), Ok(1));
        assert_eq!(c.misses("/intel/mock/foo", 1), Ok(0));
    }

    #[test]
    fn test_expired_cell_is_a_miss_but_kept() {
        let (mut c, clock) = cache();
        let m = metric(&["a"], 1);
        c.put("/a", 1, CacheValue::Single(m.clone()));
        assert!(c.get("/a", 1).is_some());

        clock.advance(TTL);
        assert_eq!(c.get("/a", 1), None);
        assert_eq!(c.hits("/a", 1), Ok(1));
        assert_eq!(c.misses("/a", 1), Ok(1));
        assert_eq!(c.len(), 1);

        // overwrite refreshes time but preserves counters
        c.put("/a", 1, CacheValue::Single(m.clone()));
        assert_eq!(c.get("/a", 1), Some(CacheValue::Single(m)));
        assert_eq!(c.hits("/a", 1), Ok(2));
        assert_eq!(c.misses("/a", 1), Ok(1));
    }

    #[test]
    fn test_just_before_ttl_is_still_a_hit() {
        let (mut c, clock) = cache();
        c.put("/a", 1, CacheValue::Single(metric(&["a"], 1)));
        clock.advance(TTL - Duration::from_millis(1));
        assert!(c.get("/a", 1).is_some());
    }

    #[test]
    fn test_first_miss_creates_trackable_cell() {
        let (mut c, _) = cache();
        assert_eq!(c.hits("/nope", 1), Err(CacheError::EntryDoesNotExist { key: "/nope:1".into() }));
        assert_eq!(c.get("/nope", 1), None);
        assert_eq!(c.misses("/nope", 1), Ok(1));
        assert_eq!(c.hits("/nope", 1), Ok(0));
    }

    #[test]
    fn test_version_is_part_of_key() {
        let (mut c, _) = cache();
        c.put("/a", 1, CacheValue::Single(metric(&["a"], 1)));
        assert!(c.get("/a", 2).is_none());
        assert!(c.get("/a", 1).is_some());
    }

    #[test]
    fn test_empty_group_is_dropped() {
        let (mut c, _) = cache();
        c.put("/a/*", 1, CacheValue::Multiple(Vec::new()));
        assert!(c.is_empty());
    }

    #[test]
    fn test_check_cache_splits_hits_and_misses() {
        let (mut c, _) = cache();
        let cached = metric(&["a", "cached"], 7);
        c.update_cache(&[cached.clone()]);

        let req = vec![
            Metric::request(Namespace::from_strs(["a", "cached"]), 1),
            Metric::request(Namespace::from_strs(["a", "fresh"]), 1),
        ];
        let (to_collect, from_cache) = c.check_cache(&req);
        assert_eq!(from_cache, vec![cached]);
        assert_eq!(to_collect.len(), 1);
        assert_eq!(to_collect[0].namespace().to_string(), "/a/fresh");
    }

    #[test]
    fn test_update_cache_groups_dynamic_metrics() {
        let (mut c, _) = cache();
        let collected: Vec<Metric> = ["host0", "host1", "host2"]
            .iter()
            .enumerate()
            .map(|(i, host)| {
                Metric::request(
                    Namespace::from_strs(["intel", "mock", host, "baz"]).with_dynamic(2, "host"),
                    1,
                )
                .with_data(i as i64)
            })
            .collect();
        c.update_cache(&collected);
        assert_eq!(c.len(), 1);

        let query = vec![Metric::request(
            Namespace::from_strs(["intel", "mock", "*", "baz"]),
            1,
        )];
        let (to_collect, from_cache) = c.check_cache(&query);
        assert!(to_collect.is_empty());
        assert_eq!(from_cache, collected);
        assert_eq!(c.hits("/intel/mock/*/baz", 1), Ok(1));
    }

    #[test]
    fn test_all_counters_aggregate() {
        let (mut c, _) = cache();
        c.put("/a", 1, CacheValue::Single(metric(&["a"], 1)));
        c.put("/b", 1, CacheValue::Single(metric(&["b"], 1)));
        let _ = c.get("/a", 1);
        let _ = c.get("/b", 1);
        let _ = c.get("/b", 1);
        let _ = c.get("/c", 1);
        assert_eq!(c.all_hits(), 3);
        assert_eq!(c.all_misses(), 1);
    }

    #[test]
    fn test_cache_error_display() {
        let e = CacheError::EntryDoesNotExist { key: "/a:1".into() };
        assert!(e.to_string().contains("cache entry does not exist"));
        let e = CacheError::CacheDoesNotExist { routing_key: "task-1".into() };
        assert!(e.to_string().contains("task-1"));
    }
}
