//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Node health scores and RPC failures
//! - Block scanning progress and decoded events
//! - Transaction execution (publishes, fee bumps, failures)
//! - Swap initiation

use crate::error::{SolverError, SolverResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Node metrics
    pub static ref NODE_SCORE: GaugeVec = register_gauge_vec!(
        "htlc_solver_node_score",
        "Current resiliency score per RPC node",
        &["network", "node"]
    ).unwrap();

    pub static ref NODE_FAILURES: CounterVec = register_counter_vec!(
        "htlc_solver_node_failures_total",
        "Total failed RPC calls",
        &["network"]
    ).unwrap();

    // Scanner metrics
    pub static ref LAST_PROCESSED_BLOCK: GaugeVec = register_gauge_vec!(
        "htlc_solver_last_processed_block",
        "Last block checkpointed by the listener",
        &["network"]
    ).unwrap();

    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_solver_events_received_total",
        "Total HTLC events decoded, by type",
        &["network", "event_type"]
    ).unwrap();

    pub static ref EVENTS_MALFORMED: CounterVec = register_counter_vec!(
        "htlc_solver_events_malformed_total",
        "HTLC logs skipped because they could not be decoded",
        &["network"]
    ).unwrap();

    pub static ref SWAPS_STARTED: CounterVec = register_counter_vec!(
        "htlc_solver_swaps_started_total",
        "Total swaps started from commit events",
        &["network"]
    ).unwrap();

    pub static ref LOCKS_SIGNALLED: CounterVec = register_counter_vec!(
        "htlc_solver_locks_signalled_total",
        "Total lock events delivered to running swaps",
        &["network"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_PUBLISHED: CounterVec = register_counter_vec!(
        "htlc_solver_transactions_published_total",
        "Total transactions broadcast",
        &["network", "operation"]
    ).unwrap();

    pub static ref FEE_BUMPS: CounterVec = register_counter_vec!(
        "htlc_solver_fee_bumps_total",
        "Total fee bumps after underpriced rejections",
        &["network"]
    ).unwrap();

    pub static ref EXECUTIONS_COMPLETED: CounterVec = register_counter_vec!(
        "htlc_solver_executions_completed_total",
        "Total intents executed successfully",
        &["network", "operation"]
    ).unwrap();

    pub static ref EXECUTIONS_FAILED: CounterVec = register_counter_vec!(
        "htlc_solver_executions_failed_total",
        "Total intents that failed permanently",
        &["network", "operation"]
    ).unwrap();

    pub static ref EXECUTION_LATENCY: HistogramVec = register_histogram_vec!(
        "htlc_solver_execution_latency_seconds",
        "Time from claim to confirmed receipt",
        &["network"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "htlc_solver_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "htlc_solver_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> SolverResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SolverError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SolverError::Internal(format!("Metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_node_score(network: &str, node: &str, score: i32) {
    NODE_SCORE
        .with_label_values(&[network, node])
        .set(score as f64);
}

pub fn record_node_failure(network: &str) {
    NODE_FAILURES.with_label_values(&[network]).inc();
}

pub fn record_last_processed_block(network: &str, block_number: u64) {
    LAST_PROCESSED_BLOCK
        .with_label_values(&[network])
        .set(block_number as f64);
}

pub fn record_event(network: &str, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[network, event_type])
        .inc();
}

pub fn record_malformed_event(network: &str) {
    EVENTS_MALFORMED.with_label_values(&[network]).inc();
}

pub fn record_swap_started(network: &str) {
    SWAPS_STARTED.with_label_values(&[network]).inc();
}

pub fn record_lock_signalled(network: &str) {
    LOCKS_SIGNALLED.with_label_values(&[network]).inc();
}

pub fn record_tx_published(network: &str, operation: &str) {
    TX_PUBLISHED
        .with_label_values(&[network, operation])
        .inc();
}

pub fn record_fee_bump(network: &str) {
    FEE_BUMPS.with_label_values(&[network]).inc();
}

pub fn record_execution_completed(network: &str, operation: &str, latency_secs: f64) {
    EXECUTIONS_COMPLETED
        .with_label_values(&[network, operation])
        .inc();
    EXECUTION_LATENCY
        .with_label_values(&[network])
        .observe(latency_secs);
}

pub fn record_execution_failed(network: &str, operation: &str) {
    EXECUTIONS_FAILED
        .with_label_values(&[network, operation])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
