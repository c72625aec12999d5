//! Prometheus metrics for the storage controller.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for controller metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("weave_controller_requests_total", "Controller calls by operation and outcome"),
        &["operation", "outcome"],
    )
    .expect("metric creation failed")
});

pub static BATCH_ITEMS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("weave_batch_items_total", "Items in batch writes by result"),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static QUOTA_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_quota_rejections_total",
        "Writes refused because the user is over quota",
    )
    .expect("metric creation failed")
});

pub static PRECONDITION_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "weave_precondition_failures_total",
        "Writes refused by X-If-Unmodified-Since",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register controller and storage metrics. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BATCH_ITEMS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUOTA_REJECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PRECONDITION_FAILURES.clone()))
            .expect("metric registration failed");
    });
    weave_storage::metrics::register_metrics();
}

/// Text exposition of every controller and storage metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut families = REGISTRY.gather();
    families.extend(weave_storage::metrics::REGISTRY.gather());

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub(crate) fn record(operation: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    REQUESTS.with_label_values(&[operation, outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_both_registries() {
        register_metrics();
        register_metrics();
        QUOTA_REJECTIONS.inc();
        weave_storage::metrics::POOL_TIMEOUTS.inc();
        let text = render().unwrap();
        assert!(text.contains("weave_quota_rejections_total"));
        assert!(text.contains("weave_pool_timeouts_total"));
    }
}
