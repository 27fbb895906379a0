//! Routing and balancer metrics
//!
//! Prometheus-compatible counters, gauges and histograms for:
//! - Routing mode per dispatched operation (targeted single/multi, scatter)
//! - Stale-version retries at the router
//! - Balancer rounds, migrations committed/aborted, migration duration

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::common::query::RoutingMode;

/// Upper bounds (ms) of the migration duration buckets; a last bucket
/// takes everything slower
const MIGRATION_BUCKETS_MS: [u64; 10] = [5, 25, 100, 250, 1_000, 5_000, 15_000, 60_000, 300_000, 900_000];

/// Cumulative millisecond histogram over [`MIGRATION_BUCKETS_MS`]
#[derive(Debug, Default)]
pub struct DurationHistogram {
    hits: [AtomicU64; MIGRATION_BUCKETS_MS.len() + 1],
    total_ms: AtomicU64,
    samples: AtomicU64,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_ms(&self, ms: u64) {
        let slot = MIGRATION_BUCKETS_MS.partition_point(|&bound| bound < ms);
        self.hits[slot].fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// `(le, cumulative count)` pairs; `None` is the +Inf bucket
    pub fn cumulative(&self) -> Vec<(Option<u64>, u64)> {
        let mut running = 0;
        self.hits
            .iter()
            .enumerate()
            .map(|(i, hits)| {
                running += hits.load(Ordering::Relaxed);
                (MIGRATION_BUCKETS_MS.get(i).copied(), running)
            })
            .collect()
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down count of things in flight
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-namespace routing counters
#[derive(Debug, Default)]
pub struct NamespaceRouting {
    pub targeted_single: Counter,
    pub targeted_multi: Counter,
    pub scatter: Counter,
    pub stale_retries: Counter,
}

impl NamespaceRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targeted(&self) -> u64 {
        self.targeted_single.get() + self.targeted_multi.get()
    }
}

/// Metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Per-namespace routing metrics
    namespaces: Mutex<HashMap<String, Arc<NamespaceRouting>>>,

    /// Router
    pub dispatch_errors: Counter,
    pub shard_unreachable: Counter,

    /// Balancer
    pub balancer_rounds: Counter,
    pub balancer_rounds_skipped: Counter,
    pub chunk_splits: Counter,
    pub migrations_started: Counter,
    pub migrations_committed: Counter,
    pub migrations_aborted: Counter,
    pub active_migrations: Gauge,
    pub migration_duration: DurationHistogram,

    /// Start time for uptime calculation
    start_time: Instant,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
            dispatch_errors: Counter::default(),
            shard_unreachable: Counter::default(),
            balancer_rounds: Counter::default(),
            balancer_rounds_skipped: Counter::default(),
            chunk_splits: Counter::default(),
            migrations_started: Counter::default(),
            migrations_committed: Counter::default(),
            migrations_aborted: Counter::default(),
            active_migrations: Gauge::default(),
            migration_duration: DurationHistogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create routing metrics for a namespace
    pub fn namespace(&self, ns: &str) -> Arc<NamespaceRouting> {
        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        namespaces
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(NamespaceRouting::new()))
            .clone()
    }

    /// Record how an operation was dispatched
    pub fn record_route(&self, ns: &str, mode: RoutingMode) {
        let metrics = self.namespace(ns);
        match mode {
            RoutingMode::TargetedSingle => metrics.targeted_single.inc(),
            RoutingMode::TargetedMulti => metrics.targeted_multi.inc(),
            RoutingMode::Scatter => metrics.scatter.inc(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let mut scalar = |name: &str, kind: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP minishard_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minishard_{} {}", name, kind);
            let _ = writeln!(out, "minishard_{} {}", name, value);
        };

        scalar(
            "dispatch_errors_total",
            "counter",
            "Operations that failed at the router",
            self.dispatch_errors.get(),
        );
        scalar(
            "shard_unreachable_total",
            "counter",
            "Dispatches that hit an unreachable shard",
            self.shard_unreachable.get(),
        );
        scalar(
            "balancer_rounds_total",
            "counter",
            "Balancer rounds run",
            self.balancer_rounds.get(),
        );
        scalar(
            "balancer_rounds_skipped_total",
            "counter",
            "Balancer rounds skipped (paused, window, leadership)",
            self.balancer_rounds_skipped.get(),
        );
        scalar(
            "chunk_splits_total",
            "counter",
            "Chunk splits performed by the balancer",
            self.chunk_splits.get(),
        );
        scalar(
            "migrations_started_total",
            "counter",
            "Migration tickets started",
            self.migrations_started.get(),
        );
        scalar(
            "migrations_committed_total",
            "counter",
            "Migration tickets committed",
            self.migrations_committed.get(),
        );
        scalar(
            "migrations_aborted_total",
            "counter",
            "Migration tickets aborted",
            self.migrations_aborted.get(),
        );
        scalar(
            "active_migrations",
            "gauge",
            "Migration tickets in flight",
            self.active_migrations.get(),
        );
        scalar(
            "uptime_seconds",
            "gauge",
            "Coordinator uptime in seconds",
            self.uptime_seconds(),
        );

        let namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        out.push_str("# HELP minishard_routed_total Operations dispatched per routing mode\n");
        out.push_str("# TYPE minishard_routed_total counter\n");
        for (ns, metrics) in namespaces.iter() {
            for (mode, value) in [
                ("targeted_single", metrics.targeted_single.get()),
                ("targeted_multi", metrics.targeted_multi.get()),
                ("scatter", metrics.scatter.get()),
            ] {
                let _ = writeln!(
                    out,
                    "minishard_routed_total{{ns=\"{}\",mode=\"{}\"}} {}",
                    ns, mode, value
                );
            }
        }

        out.push_str("# HELP minishard_stale_retries_total Router retries after a stale version\n");
        out.push_str("# TYPE minishard_stale_retries_total counter\n");
        for (ns, metrics) in namespaces.iter() {
            let _ = writeln!(
                out,
                "minishard_stale_retries_total{{ns=\"{}\"}} {}",
                ns,
                metrics.stale_retries.get()
            );
        }

        out.push_str("# HELP minishard_migration_duration_ms Migration duration in milliseconds\n");
        out.push_str("# TYPE minishard_migration_duration_ms histogram\n");
        for (le, count) in self.migration_duration.cumulative() {
            let le = le.map_or_else(|| "+Inf".to_string(), |ms| ms.to_string());
            let _ = writeln!(
                out,
                "minishard_migration_duration_ms_bucket{{le=\"{}\"}} {}",
                le, count
            );
        }
        let _ = writeln!(
            out,
            "minishard_migration_duration_ms_sum {}",
            self.migration_duration.total_ms()
        );
        let _ = writeln!(
            out,
            "minishard_migration_duration_ms_count {}",
            self.migration_duration.samples()
        );

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));
