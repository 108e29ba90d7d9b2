//! Prometheus metrics for the courier pipeline
//!
//! Provides centralized metrics collection for monitoring:
//! - Broker connection health
//! - Notification publishing
//! - Queue consumption and acknowledgement
//! - Pending-delivery table size

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder, opts, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

// ============================================================================
// Broker Connection Metrics
// ============================================================================

/// Connect attempts, labelled by outcome ("success" / "failure")
pub static BROKER_CONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_broker_connect_attempts_total",
            "Broker connect attempts by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to register BROKER_CONNECT_ATTEMPTS metric")
});

/// Connect sequences that ran out of attempts
pub static BROKER_CONNECT_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_broker_connect_exhausted_total",
        "Connect sequences that exhausted their retry budget"
    ))
    .expect("Failed to register BROKER_CONNECT_EXHAUSTED metric")
});

/// Reconnects triggered by an I/O failure on an established channel
pub static BROKER_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_broker_reconnects_total",
        "Reconnects after a publish or consume failure"
    ))
    .expect("Failed to register BROKER_RECONNECTS metric")
});

// ============================================================================
// Publish Metrics
// ============================================================================

/// Payloads confirmed by the broker
pub static NOTIFY_PUBLISH_SUCCESS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_notify_publish_success_total",
        "Payloads published and confirmed by the broker"
    ))
    .expect("Failed to register NOTIFY_PUBLISH_SUCCESS metric")
});

/// Payloads that could not be published even after a reconnect
pub static NOTIFY_PUBLISH_FAILURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_notify_publish_failure_total",
        "Payloads that failed to publish after one reconnect-and-retry"
    ))
    .expect("Failed to register NOTIFY_PUBLISH_FAILURE metric")
});

// ============================================================================
// Consumer Metrics
// ============================================================================

/// Deliveries handled and acknowledged
pub static DELIVERIES_ACKED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_deliveries_acked_total",
        "Deliveries handled successfully and acknowledged"
    ))
    .expect("Failed to register DELIVERIES_ACKED metric")
});

/// Deliveries handed back to the broker after a handler failure
pub static DELIVERIES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "courier_deliveries_rejected_total",
        "Deliveries rejected for redelivery after a handler failure"
    ))
    .expect("Failed to register DELIVERIES_REJECTED metric")
});

// ============================================================================
// Aggregator Metrics
// ============================================================================

/// Recipients with undelivered notifications in the pending table
pub static PENDING_RECIPIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "courier_pending_recipients",
        "Recipients with pending notifications"
    ))
    .expect("Failed to register PENDING_RECIPIENTS metric")
});

// ============================================================================
// Metrics Collection
// ============================================================================

/// Gather all registered metrics and encode as Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
