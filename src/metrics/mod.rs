//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap lifecycle and status transitions
//! - Chain calls, latency and health
//! - Applied chain events and desynchronization
//! - Escrow monitors

use crate::coordination::swap::SwapStatus;
use crate::error::ChainResult;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Swap metrics
    pub static ref SWAPS_INITIATED: Counter = register_counter!(
        "swap_coordinator_swaps_initiated_total",
        "Total swaps accepted by the coordinator"
    ).unwrap();

    pub static ref SWAP_STATUS: CounterVec = register_counter_vec!(
        "swap_coordinator_status_transitions_total",
        "Total swap status transitions by target status",
        &["status"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "swap_coordinator_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_CALLS: CounterVec = register_counter_vec!(
        "swap_coordinator_chain_calls_total",
        "Total chain calls by operation and outcome",
        &["chain_id", "operation", "outcome"]
    ).unwrap();

    pub static ref CHAIN_CALL_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_coordinator_chain_call_latency_seconds",
        "Chain call latency",
        &["chain_id", "operation"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_APPLIED: CounterVec = register_counter_vec!(
        "swap_coordinator_events_applied_total",
        "Total chain events applied to swap records",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref DESYNC_DETECTED: CounterVec = register_counter_vec!(
        "swap_coordinator_desync_detected_total",
        "Total desynchronizations detected between chain and record",
        &["chain_id"]
    ).unwrap();

    // Monitor metrics
    pub static ref MONITOR_ERRORS: CounterVec = register_counter_vec!(
        "swap_coordinator_monitor_errors_total",
        "Total subscription and polling errors",
        &["chain_id"]
    ).unwrap();

    pub static ref ACTIVE_MONITORS: Gauge = register_gauge!(
        "swap_coordinator_active_monitors",
        "Escrow monitors currently running"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_swap_created() {
    SWAPS_INITIATED.inc();
}

pub fn record_status(status: SwapStatus) {
    SWAP_STATUS.with_label_values(&[status.as_str()]).inc();
}

pub fn record_chain_health(chain_id: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain_id])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_call<T>(chain_id: &str, operation: &str, result: &ChainResult<T>, latency_secs: f64) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    CHAIN_CALLS
        .with_label_values(&[chain_id, operation, outcome])
        .inc();
    CHAIN_CALL_LATENCY
        .with_label_values(&[chain_id, operation])
        .observe(latency_secs);
}

pub fn record_event_applied(chain_id: &str, event_type: &str) {
    EVENTS_APPLIED
        .with_label_values(&[chain_id, event_type])
        .inc();
}

pub fn record_desync(chain_id: &str) {
    DESYNC_DETECTED.with_label_values(&[chain_id]).inc();
}

pub fn record_monitor_error(chain_id: &str) {
    MONITOR_ERRORS.with_label_values(&[chain_id]).inc();
}

pub fn record_monitor_started() {
    ACTIVE_MONITORS.inc();
}

pub fn record_monitor_stopped() {
    ACTIVE_MONITORS.dec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainId;
    use crate::error::ChainError;

    #[test]
    fn test_chain_call_outcome_labels() {
        let ok: ChainResult<()> = Ok(());
        let err: ChainResult<()> = Err(ChainError::InsufficientGas {
            chain_id: ChainId::from("metrics-test"),
        });

        record_chain_call("metrics-test", "deploy", &ok, 0.2);
        record_chain_call("metrics-test", "deploy", &err, 0.1);

        assert!(CHAIN_CALLS.with_label_values(&["metrics-test", "deploy", "ok"]).get() >= 1.0);
        assert!(
            CHAIN_CALLS
                .with_label_values(&["metrics-test", "deploy", "insufficient_gas"])
                .get()
                >= 1.0
        );
    }
}
