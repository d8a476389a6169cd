//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Dispatched actions
//! - Transaction lifecycle and latency
//! - Grouped workflows
//! - Normalised events and client health

use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    pub static ref ACTIONS_DISPATCHED: CounterVec = register_counter_vec!(
        "colony_coordinator_actions_total",
        "Actions applied by the coordination engine",
        &["action_type"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "colony_coordinator_transactions_created_total",
        "Transactions created per contract context",
        &["context"]
    ).unwrap();

    pub static ref TX_SENT: CounterVec = register_counter_vec!(
        "colony_coordinator_transactions_sent_total",
        "Transactions broadcast per contract context",
        &["context"]
    ).unwrap();

    pub static ref TX_SUCCEEDED: CounterVec = register_counter_vec!(
        "colony_coordinator_transactions_succeeded_total",
        "Transactions mined successfully per contract context",
        &["context"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "colony_coordinator_transactions_failed_total",
        "Failed transactions by contract context and error kind",
        &["context", "kind"]
    ).unwrap();

    pub static ref TX_CANCELLED: CounterVec = register_counter_vec!(
        "colony_coordinator_transactions_cancelled_total",
        "Transactions removed by cancellation",
        &[]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "colony_coordinator_transaction_latency_seconds",
        "Time from creation to a successful receipt",
        &["context"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Group metrics
    pub static ref GROUPS: CounterVec = register_counter_vec!(
        "colony_coordinator_groups_total",
        "Grouped workflows by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref OPEN_CHANNELS: Gauge = register_gauge!(
        "colony_coordinator_open_channels",
        "Per-transaction channels currently open"
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_NORMALIZED: CounterVec = register_counter_vec!(
        "colony_coordinator_events_normalized_total",
        "Events normalised by name",
        &["event"]
    ).unwrap();

    // Health metrics
    pub static ref CLIENT_HEALTHY: Gauge = register_gauge!(
        "colony_coordinator_client_healthy",
        "Contract client health (1=healthy, 0=unreachable)"
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

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

/// Text exposition of every registered metric
pub fn render() -> CoordinatorResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| CoordinatorError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| CoordinatorError::Internal(format!("Metrics are not UTF-8: {}", e)))
}

pub async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("{}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

// Helper functions to record metrics

pub fn record_action(action_type: &str) {
    ACTIONS_DISPATCHED.with_label_values(&[action_type]).inc();
}

pub fn record_tx_created(context: &str) {
    TX_CREATED.with_label_values(&[context]).inc();
}

pub fn record_tx_sent(context: &str) {
    TX_SENT.with_label_values(&[context]).inc();
}

pub fn record_tx_succeeded(context: &str, latency_secs: f64) {
    TX_SUCCEEDED.with_label_values(&[context]).inc();
    TX_LATENCY.with_label_values(&[context]).observe(latency_secs);
}

pub fn record_tx_failed(context: &str, kind: &str) {
    TX_FAILED.with_label_values(&[context, kind]).inc();
}

pub fn record_tx_cancelled(count: usize) {
    TX_CANCELLED.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_group_started() {
    GROUPS.with_label_values(&["started"]).inc();
}

pub fn record_group_completed(success: bool) {
    let outcome = if success { "succeeded" } else { "failed" };
    GROUPS.with_label_values(&[outcome]).inc();
}

pub fn set_open_channels(count: usize) {
    OPEN_CHANNELS.set(count as f64);
}

/// Label for event names no configured ABI declares
pub const UNKNOWN_EVENT: &str = "unknown";

/// Count a normalised event. Only ABI-declared names become labels.
pub fn record_event_normalized(name: &str, declared: bool) {
    let label = if declared { name } else { UNKNOWN_EVENT };
    EVENTS_NORMALIZED.with_label_values(&[label]).inc();
}

pub fn set_client_health(healthy: bool) {
    CLIENT_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_action("TRANSACTION_CREATED");
        record_tx_failed("colony", "gas_estimation");
        record_group_completed(false);
        record_event_normalized("ColonyRoleSet", true);
        record_event_normalized("0xattacker-chosen-name", false);

        let text = render().unwrap();
        assert!(text.contains("event=\"ColonyRoleSet\""));
        assert!(text.contains("event=\"unknown\""));
        assert!(!text.contains("attacker-chosen"));
        assert!(text.contains("colony_coordinator_actions_total"));
        assert!(text.contains("kind=\"gas_estimation\""));
        assert!(text.contains("outcome=\"failed\""));
    }
}
