//! Metrics module for billing-service.
//! Provides Prometheus metrics for metering, aggregation, alerting and dunning.
//!
//! Labels never carry tenant identifiers.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Events ingested, by outcome (accepted, duplicate, rejected)
pub static EVENTS_INGESTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Aggregations computed, by aggregation type and status
pub static AGGREGATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Aggregation duration histogram
pub static AGGREGATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Alert evaluations that crossed at least one threshold
pub static ALERTS_TRIGGERED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dunning attempts, by outcome
pub static DUNNING_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Background jobs processed, by job name and outcome
pub static JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    EVENTS_INGESTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_events_ingested_total", "Usage events ingested by outcome"),
            &["outcome"]
        )
        .expect("Failed to register EVENTS_INGESTED_TOTAL")
    });

    AGGREGATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_aggregations_total",
                "Usage aggregations by aggregation type and status"
            ),
            &["aggregation_type", "status"]
        )
        .expect("Failed to register AGGREGATIONS_TOTAL")
    });

    // Aggregations over long recurring windows can take seconds
    AGGREGATION_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_aggregation_duration_seconds",
                "Usage aggregation duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["aggregation_type"]
        )
        .expect("Failed to register AGGREGATION_DURATION")
    });

    ALERTS_TRIGGERED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_alerts_triggered_total", "Triggered usage alerts by type"),
            &["alert_type"]
        )
        .expect("Failed to register ALERTS_TRIGGERED_TOTAL")
    });

    DUNNING_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_dunning_attempts_total", "Dunning attempts by outcome"),
            &["outcome"]
        )
        .expect("Failed to register DUNNING_ATTEMPTS_TOTAL")
    });

    JOBS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_jobs_total", "Background jobs by name and outcome"),
            &["job", "outcome"]
        )
        .expect("Failed to register JOBS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an ingested event.
pub fn record_event_ingested(outcome: &str) {
    if let Some(counter) = EVENTS_INGESTED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an aggregation and how long it took.
pub fn record_aggregation(aggregation_type: &str, status: &str, duration_secs: f64) {
    if let Some(counter) = AGGREGATIONS_TOTAL.get() {
        counter.with_label_values(&[aggregation_type, status]).inc();
    }
    if let Some(histogram) = AGGREGATION_DURATION.get() {
        histogram
            .with_label_values(&[aggregation_type])
            .observe(duration_secs);
    }
}

/// Record a triggered alert.
pub fn record_alert_triggered(alert_type: &str) {
    if let Some(counter) = ALERTS_TRIGGERED_TOTAL.get() {
        counter.with_label_values(&[alert_type]).inc();
    }
}

/// Record a dunning attempt.
pub fn record_dunning_attempt(outcome: &str) {
    if let Some(counter) = DUNNING_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a processed job.
pub fn record_job(job: &str, outcome: &str) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[job, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
