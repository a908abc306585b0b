//! Prometheus metrics for pools, routing and caching.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_cache_hit`, `inc_selection`, …) are no-ops if `init_metrics` was
//! never called, so pools and caches work unchanged without metrics.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `plugin_pool_cache_hits_total` | Counter | `pool` |
//! | `plugin_pool_cache_misses_total` | Counter | `pool` |
//! | `plugin_pool_selections_total` | Counter | `pool`, `strategy` |
//! | `plugin_pool_selection_failures_total` | Counter | `pool`, `strategy` |
//! | `plugin_pool_instances` | Gauge | `pool` |
//! | `plugin_pool_restarts_total` | Counter | `pool` |

use crate::RuntimeError;
use prometheus::{core::Collector, CounterVec, Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All metrics, bundled so they can live in a single [`OnceLock`].
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Cache lookups answered from a fresh cell.
    pub cache_hits: CounterVec,
    /// Cache lookups that found nothing fresh.
    pub cache_misses: CounterVec,
    /// Successful instance selections.
    pub selections: CounterVec,
    /// Selections that found no eligible instance.
    pub selection_failures: CounterVec,
    /// Live instances per pool.
    pub instances: IntGaugeVec,
    /// Restarts after instance death.
    pub restarts: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec, RuntimeError> {
    let c = CounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| RuntimeError::Other(format!("metrics init failed: {e}")))?;
    register(registry, c)
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> Result<C, RuntimeError> {
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| RuntimeError::Other(format!("metrics registration failed: {e}")))?;
    Ok(c)
}

fn build(prefix: &str) -> Result<Metrics, RuntimeError> {
    let registry = Registry::new();
    let cache_hits = counter(
        &registry,
        &format!("{prefix}_cache_hits_total"),
        "Cache lookups served from a fresh cell",
        &["pool"],
    )?;
    let cache_misses = counter(
        &registry,
        &format!("{prefix}_cache_misses_total"),
        "Cache lookups that required collection",
        &["pool"],
    )?;
    let selections = counter(
        &registry,
        &format!("{prefix}_selections_total"),
        "Instances selected to serve a request",
        &["pool", "strategy"],
    )?;
    let selection_failures = counter(
        &registry,
        &format!("{prefix}_selection_failures_total"),
        "Selections with no eligible instance",
        &["pool", "strategy"],
    )?;
    let instances = IntGaugeVec::new(
        Opts::new(format!("{prefix}_instances"), "Live instances per pool"),
        &["pool"],
    )
    .map_err(|e| RuntimeError::Other(format!("metrics init failed: {e}")))?;
    let instances = register(&registry, instances)?;
    let restarts = counter(
        &registry,
        &format!("{prefix}_restarts_total"),
        "Forced restarts after instance death",
        &["pool"],
    )?;

    Ok(Metrics {
        registry,
        cache_hits,
        cache_misses,
        selections,
        selection_failures,
        instances,
        restarts,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RuntimeError::Other`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), RuntimeError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let m = build("plugin_pool")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(m);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a cache hit for `pool`.
pub fn inc_cache_hit(pool: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_hits.get_metric_with_label_values(&[pool]) {
            c.inc();
        }
    }
}

/// Count a cache miss for `pool`.
pub fn inc_cache_miss(pool: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_misses.get_metric_with_label_values(&[pool]) {
            c.inc();
        }
    }
}

/// Count a successful selection.
pub fn inc_selection(pool: &str, strategy: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.selections.get_metric_with_label_values(&[pool, strategy]) {
            c.inc();
        }
    }
}

/// Count a failed selection.
pub fn inc_selection_failure(pool: &str, strategy: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .selection_failures
            .get_metric_with_label_values(&[pool, strategy])
        {
            c.inc();
        }
    }
}

/// Record the number of live instances in `pool`.
pub fn set_pool_instances(pool: &str, count: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.instances.get_metric_with_label_values(&[pool]) {
            g.set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}

/// Count a restart after instance death.
pub fn inc_restart(pool: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.restarts.get_metric_with_label_values(&[pool]) {
            c.inc();
        }
    }
}

/// Gather and encode all metrics in the Prometheus text format.
///
/// Returns an empty string if metrics are not initialised or encoding fails.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&m.registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Cache counters per pool, read back from the registry.
#[derive(Debug, Default)]
pub struct CacheSummary {
    /// Hits keyed by pool.
    pub hits: HashMap<String, u64>,
    /// Misses keyed by pool.
    pub misses: HashMap<String, u64>,
}

fn per_pool(vec: &CounterVec) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let pool = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "pool")
                .map_or("unknown", |l| l.get_value());
            out.insert(pool.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Current cache counters; zeroed if metrics are not initialised.
pub fn cache_summary() -> CacheSummary {
    let Some(m) = metrics() else {
        return CacheSummary::default();
    };
    CacheSummary {
        hits: per_pool(&m.cache_hits),
        misses: per_pool(&m.cache_misses),
    }
}
