//! Prometheus metrics for the storage engine.
//!
//! Metrics are created lazily and only exported once [`register_metrics`]
//! has added them to [`REGISTRY`]. Counters still count when unregistered.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for storage metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Connection pool
pub static POOL_BACKLOG_EXCEEDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_pool_backlog_exceeded_total",
        "Connection requests rejected because too many callers were waiting",
    )
    .expect("metric creation failed")
});

pub static POOL_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_pool_timeouts_total",
        "Connection requests that timed out waiting for the pool",
    )
    .expect("metric creation failed")
});

pub static POOL_DISPOSALS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_pool_disposals_total",
        "Connection pools thrown away after an operational database error",
    )
    .expect("metric creation failed")
});

// Query execution
pub static QUERY_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_query_retries_total",
        "Statements retried after a transient database error",
    )
    .expect("metric creation failed")
});

pub static QUERY_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("weave_query_errors_total", "Database errors by class"),
        &["class"],
    )
    .expect("metric creation failed")
});

pub static QUERIES_INTERRUPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_queries_interrupted_total",
        "Statements abandoned by their caller before completion",
    )
    .expect("metric creation failed")
});

pub static QUERY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "weave_query_duration_seconds",
            "Statement latency including connection acquisition",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Cache overlay
pub static CACHE_FALLBACKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "weave_cache_fallbacks_total",
            "Cache operations that failed and fell back to SQL",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

pub static QUOTA_RECALCULATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_quota_recalculations_total",
        "Total size recomputations from the database",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(POOL_BACKLOG_EXCEEDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_TIMEOUTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(POOL_DISPOSALS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERY_RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERY_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERIES_INTERRUPTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERY_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_FALLBACKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUOTA_RECALCULATIONS.clone()))
            .expect("metric registration failed");
    });
}
