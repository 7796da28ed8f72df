//! Metrics module for enforcement-service.
//! Provides Prometheus metrics for enforcement passes, network control and notifications.

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
            "enforcement_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Batch passes by operation and final status
pub static BATCH_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-item outcomes inside batch passes
pub static BATCH_ITEMS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Batch pass duration
pub static BATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// CoA requests by action and result
pub static COA_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// CoA round-trip latency
pub static COA_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Notifications by template and delivery status
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription lifecycle transitions
pub static SUBSCRIPTION_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Scheduler triggers skipped because the job was already running
pub static JOB_TRIGGERS_COALESCED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BATCH_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_batch_runs_total",
                "Total enforcement passes by operation and status"
            ),
            &["operation", "status"]
        )
        .expect("Failed to register BATCH_RUNS_TOTAL")
    });

    BATCH_ITEMS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_batch_items_total",
                "Items processed by enforcement passes by outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register BATCH_ITEMS_TOTAL")
    });

    BATCH_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "enforcement_batch_duration_seconds",
                "Enforcement pass duration",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]
            ),
            &["operation"]
        )
        .expect("Failed to register BATCH_DURATION")
    });

    COA_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_coa_requests_total",
                "Total CoA requests by action and result"
            ),
            &["action", "result"]
        )
        .expect("Failed to register COA_REQUESTS_TOTAL")
    });

    // Device round-trips, bounded by the CoA timeout
    COA_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "enforcement_coa_request_duration_seconds",
                "CoA request duration",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["action"]
        )
        .expect("Failed to register COA_REQUEST_DURATION")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_notifications_total",
                "Total notifications by template and status"
            ),
            &["template", "status"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    SUBSCRIPTION_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_subscription_transitions_total",
                "Subscription lifecycle transitions by target status and reason"
            ),
            &["status", "reason"]
        )
        .expect("Failed to register SUBSCRIPTION_TRANSITIONS_TOTAL")
    });

    JOB_TRIGGERS_COALESCED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "enforcement_job_triggers_coalesced_total",
                "Job triggers skipped because a run was already in flight"
            ),
            &["operation"]
        )
        .expect("Failed to register JOB_TRIGGERS_COALESCED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("enforcement_errors_total", "Total errors by type for alerting"),
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

/// Record a finished batch pass.
pub fn record_batch_run(operation: &str, status: &str, duration_secs: f64) {
    if let Some(counter) = BATCH_RUNS_TOTAL.get() {
        counter.with_label_values(&[operation, status]).inc();
    }
    if let Some(histogram) = BATCH_DURATION.get() {
        histogram
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

/// Record one item outcome.
pub fn record_batch_item(operation: &str, outcome: &str) {
    if let Some(counter) = BATCH_ITEMS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record a CoA request.
pub fn record_coa_request(action: &str, result: &str, duration_secs: f64) {
    if let Some(counter) = COA_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[action, result]).inc();
    }
    if let Some(histogram) = COA_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[action])
            .observe(duration_secs);
    }
}

/// Record a notification delivery attempt.
pub fn record_notification(template: &str, status: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[template, status]).inc();
    }
}

/// Record a subscription transition.
pub fn record_transition(status: &str, reason: &str) {
    if let Some(counter) = SUBSCRIPTION_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[status, reason]).inc();
    }
}

/// Record a coalesced trigger.
pub fn record_coalesced_trigger(operation: &str) {
    if let Some(counter) = JOB_TRIGGERS_COALESCED_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
