//! Prometheus metrics for ledger-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec,
    HistogramVec, IntCounterVec, TextEncoder,
};

/// Wallet transactions created, by kind and status (no tenant labels).
pub static WALLET_TRANSACTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_wallet_transactions_total",
        "Total number of wallet transactions created",
        &["kind", "status"]
    )
    .expect("Failed to register wallet_transactions_total")
});

/// Credits moved through the ledger, by direction.
pub static CREDITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_credits_total",
        "Total credits added to or removed from wallets",
        &["direction"]
    )
    .expect("Failed to register credits_total")
});

/// Consumption rows written by the allocator.
pub static CONSUMPTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_consumptions_total",
        "Total number of inbound transactions debited",
        &["mode"]
    )
    .expect("Failed to register consumptions_total")
});

/// Depleted-ongoing-balance transitions.
pub static DEPLETION_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_depletion_transitions_total",
        "Wallet ongoing balance crossing zero",
        &["direction"]
    )
    .expect("Failed to register depletion_transitions_total")
});

/// Automatic top-ups scheduled, by trigger.
pub static TOP_UPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_top_ups_total",
        "Automatic top-ups scheduled",
        &["trigger"]
    )
    .expect("Failed to register top_ups_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ledger_errors_total",
        "Total number of errors by code",
        &["operation", "code"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&WALLET_TRANSACTIONS_TOTAL);
    Lazy::force(&CREDITS_TOTAL);
    Lazy::force(&CONSUMPTIONS_TOTAL);
    Lazy::force(&DEPLETION_TRANSITIONS_TOTAL);
    Lazy::force(&TOP_UPS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

pub fn record_transaction(kind: &str, status: &str) {
    WALLET_TRANSACTIONS_TOTAL
        .with_label_values(&[kind, status])
        .inc();
}

pub fn record_credits(direction: &str, credits: f64) {
    if credits > 0.0 {
        CREDITS_TOTAL.with_label_values(&[direction]).inc_by(credits);
    }
}

pub fn record_error(operation: &str, code: &str) {
    ERRORS_TOTAL.with_label_values(&[operation, code]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
