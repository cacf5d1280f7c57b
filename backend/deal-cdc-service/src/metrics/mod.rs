/// Prometheus metrics for the deal CDC pipeline
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, HistogramVec, IntGauge, Registry,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    /// Global registry for all metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ======================
    // Counters
    // ======================

    /// Change events pulled from the source (labels: operation=c|u|d|r|undecodable)
    pub static ref CDC_EVENTS_CONSUMED: CounterVec = register_counter_vec_with_registry!(
        "deal_cdc_events_consumed_total",
        "Total number of change events pulled from the source",
        &["operation"],
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");

    /// Records dropped before the writer (labels: reason)
    pub static ref CDC_RECORDS_REJECTED: CounterVec = register_counter_vec_with_registry!(
        "deal_cdc_records_rejected_total",
        "Total number of change records dropped by translation or integrity checks",
        &["reason"],
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");

    /// Batch commit outcomes (labels: outcome=committed|failed|held)
    pub static ref CDC_BATCH_COMMITS: CounterVec = register_counter_vec_with_registry!(
        "deal_cdc_batch_commits_total",
        "Total number of batch flushes by outcome",
        &["outcome"],
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");

    /// Chunk write outcomes (labels: outcome=success|failed)
    pub static ref CDC_CHUNK_WRITES: CounterVec = register_counter_vec_with_registry!(
        "deal_cdc_chunk_writes_total",
        "Total number of staging chunk writes by outcome",
        &["outcome"],
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");

    // ======================
    // Histograms
    // ======================

    /// Time to write a batch and commit the source position (labels: outcome)
    pub static ref CDC_FLUSH_DURATION_SECONDS: HistogramVec = register_histogram_vec_with_registry!(
        "deal_cdc_flush_duration_seconds",
        "Time spent flushing one batch",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");

    // ======================
    // Gauges
    // ======================

    /// Fingerprints held by the recent-history dedup cache
    pub static ref CDC_DEDUP_CACHE_SIZE: IntGauge = register_int_gauge_with_registry!(
        "deal_cdc_dedup_cache_size",
        "Fingerprints currently held by the dedup cache",
        REGISTRY
    )
    .expect("Prometheus metrics registration should succeed at startup");
}

/// Render all metrics in the text exposition format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper functions for common metric operations
pub mod helpers {
    use super::*;
    use std::time::Instant;

    pub fn record_event(operation: &str) {
        CDC_EVENTS_CONSUMED.with_label_values(&[operation]).inc();
    }

    pub fn record_rejection(reason: &str) {
        CDC_RECORDS_REJECTED.with_label_values(&[reason]).inc();
    }

    pub fn record_chunk_write(success: bool) {
        let outcome = if success { "success" } else { "failed" };
        CDC_CHUNK_WRITES.with_label_values(&[outcome]).inc();
    }

    pub fn set_dedup_cache_size(size: usize) {
        CDC_DEDUP_CACHE_SIZE.set(size as i64);
    }

    /// Times one flush; the outcome label is chosen when it finishes
    pub struct FlushTimer {
        start: Instant,
    }

    impl FlushTimer {
        pub fn start() -> Self {
            Self {
                start: Instant::now(),
            }
        }

        pub fn finish(self, outcome: &str) {
            CDC_BATCH_COMMITS.with_label_values(&[outcome]).inc();
            CDC_FLUSH_DURATION_SECONDS
                .with_label_values(&[outcome])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}
