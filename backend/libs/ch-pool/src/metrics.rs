//! Prometheus metrics for the ClickHouse client pool
//!
//! Tracks lease latency, lease failures and how many clients sit idle

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Idle clients per pool
    static ref CH_POOL_AVAILABLE: IntGaugeVec = register_int_gauge_vec!(
        "ch_pool_available_clients",
        "ClickHouse clients currently available for lease",
        &["pool"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time spent waiting for a client lease
    static ref CH_POOL_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "ch_pool_acquire_duration_seconds",
        "Time to lease a client from the ClickHouse pool",
        &["pool"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Failed leases by type
    static ref CH_POOL_ACQUIRE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "ch_pool_acquire_errors_total",
        "ClickHouse client lease failures",
        &["pool", "error_type"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_acquire(pool: &str, waited: Duration, available: usize) {
    CH_POOL_ACQUIRE_DURATION
        .with_label_values(&[pool])
        .observe(waited.as_secs_f64());
    CH_POOL_AVAILABLE
        .with_label_values(&[pool])
        .set(available as i64);
}

pub(crate) fn record_acquire_error(pool: &str, error_type: &str) {
    CH_POOL_ACQUIRE_ERRORS
        .with_label_values(&[pool, error_type])
        .inc();
}

pub(crate) fn record_release(pool: &str, available: usize) {
    CH_POOL_AVAILABLE
        .with_label_values(&[pool])
        .set(available as i64);
}
