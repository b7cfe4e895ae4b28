//! Prometheus metrics describing the exporter itself.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================
    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "access_log_exporter_tick_duration_seconds",
        "Time spent reading, parsing and exporting one polling period",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref LINES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "access_log_exporter_lines_total",
        "Access log lines by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref BYTES_READ_TOTAL: IntCounter = register_int_counter!(
        "access_log_exporter_bytes_read_total",
        "Bytes read from the access log"
    )
    .unwrap();
    pub static ref SINK_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "access_log_exporter_sink_writes_total",
        "Metric sink calls by operation and status",
        &["operation", "status"]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref PARSE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "access_log_exporter_parse_errors_total",
        "Dropped access log lines by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref ROTATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "access_log_exporter_rotations_total",
        "Detected log rotations by kind",
        &["kind"]
    )
    .unwrap();
}

pub(crate) fn record_sink_call<T>(operation: &str, result: &anyhow::Result<T>) {
    let status = if result.is_ok() { "ok" } else { "error" };
    SINK_WRITES_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}
