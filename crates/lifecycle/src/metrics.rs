//! Prometheus metrics for lifecycle runs.
//!
//! Jobs run to completion and exit, so metrics live in a process-local
//! registry and are rendered once at the end of a run (`--metrics`).

use crate::error::{LifecycleError, LifecycleResult};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Registry for all lifecycle metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Garbage collection
pub static GC_KEYS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_gc_keys_total",
            "Pending deletions processed by the garbage collector, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_gc_errors_total",
            "Failed physical deletions by failure reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static GC_DEAD_LETTERS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "folio_gc_dead_letters_total",
        "Keys moved to the dead-letter table after exhausting their attempts",
    )
    .expect("metric creation failed")
});

pub static GC_REREFERENCED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "folio_gc_rereferenced_total",
        "Keys re-referenced between physical deletion and ledger cleanup",
    )
    .expect("metric creation failed")
});

pub static RUN_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "folio_lifecycle_run_duration_seconds",
            "Wall-clock duration of a lifecycle operation",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["operation"],
    )
    .expect("metric creation failed")
});

// Enqueue
pub static ENQUEUE_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_enqueue_outcomes_total",
            "Deletion requests by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Ledger integrity
pub static COUNTER_CLAMPS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "folio_ledger_counter_clamps_total",
        "Reference counter decrements clamped at zero",
    )
    .expect("metric creation failed")
});

// Reindex
pub static REINDEX_KEYS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "folio_reindex_keys",
        "Distinct media keys discovered by the last reindex",
    )
    .expect("metric creation failed")
});

// Audit
pub static AUDIT_ORPHANS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "folio_audit_orphans",
        "Stored objects without a usage record in the last audit",
    )
    .expect("metric creation failed")
});

pub static AUDIT_MISSING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "folio_audit_missing",
        "Stale usage records whose object is absent in the last audit",
    )
    .expect("metric creation failed")
});

pub static STORAGE_LISTING_PAGES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "folio_storage_listing_pages_total",
            "Storage listing pages fetched, by backend",
        ),
        &["backend"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(GC_KEYS.clone()),
            Box::new(GC_ERRORS.clone()),
            Box::new(GC_DEAD_LETTERS.clone()),
            Box::new(GC_REREFERENCED.clone()),
            Box::new(RUN_DURATION.clone()),
            Box::new(ENQUEUE_OUTCOMES.clone()),
            Box::new(COUNTER_CLAMPS.clone()),
            Box::new(REINDEX_KEYS.clone()),
            Box::new(AUDIT_ORPHANS.clone()),
            Box::new(AUDIT_MISSING.clone()),
            Box::new(STORAGE_LISTING_PAGES.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode() -> LifecycleResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| LifecycleError::Config(format!("failed to encode metrics: {e}")))?;
    String::from_utf8(buffer)
        .map_err(|e| LifecycleError::Config(format!("metrics are not UTF-8: {e}")))
}

pub fn observe_duration(operation: &str, elapsed: std::time::Duration) {
    RUN_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration_and_encoding() {
        register_metrics();
        register_metrics();

        GC_KEYS.with_label_values(&["deleted"]).inc();
        observe_duration("gc", std::time::Duration::from_millis(12));

        let text = encode().unwrap();
        assert!(text.contains("folio_gc_keys_total"));
        assert!(text.contains("folio_lifecycle_run_duration_seconds"));
    }
}
