//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and scan progress
//! - Loan transitions, halts and time to a terminal state
//! - Relay dispatches and deliveries
//! - Transactions and wallet balance

use crate::error::{RelayerError, RelayerResult};
use crate::types::Domain;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "iploan_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "iploan_chain_block_height",
        "Last finalized block scanned per domain",
        &["domain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "iploan_events_received_total",
        "Ledger events received by type",
        &["domain", "event_type"]
    ).unwrap();

    // Loan metrics
    pub static ref LOANS_REQUESTED: CounterVec = register_counter_vec!(
        "iploan_loans_requested_total",
        "Loan requests accepted for orchestration",
        &[]
    ).unwrap();

    pub static ref LOAN_TRANSITIONS: CounterVec = register_counter_vec!(
        "iploan_loan_transitions_total",
        "Loan state transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref LOANS_IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "iploan_loans_in_flight",
        "Loans not yet in a terminal state",
        &[]
    ).unwrap();

    pub static ref LOANS_HALTED: CounterVec = register_counter_vec!(
        "iploan_loans_halted_total",
        "Loans halted for operator intervention",
        &[]
    ).unwrap();

    pub static ref LOAN_TIME_TO_TERMINAL: HistogramVec = register_histogram_vec!(
        "iploan_loan_time_to_terminal_seconds",
        "Time from request to terminal state",
        &["outcome"],
        vec![60.0, 600.0, 3600.0, 86400.0, 604800.0, 2592000.0, 7776000.0]
    ).unwrap();

    pub static ref INVARIANT_VIOLATIONS: CounterVec = register_counter_vec!(
        "iploan_invariant_violations_total",
        "Observed facts that contradict the loan lifecycle",
        &["kind"]
    ).unwrap();

    // Relay metrics
    pub static ref DISPATCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "iploan_dispatch_attempts_total",
        "Cross-chain message dispatch attempts",
        &["kind"]
    ).unwrap();

    pub static ref DISPATCH_FAILURES: CounterVec = register_counter_vec!(
        "iploan_dispatch_failures_total",
        "Failed dispatches by error class",
        &["kind", "class"]
    ).unwrap();

    pub static ref RELEASE_STALLED: CounterVec = register_counter_vec!(
        "iploan_release_stalled_total",
        "Release dispatches retried past the attempt budget",
        &[]
    ).unwrap();

    pub static ref MESSAGES_DELIVERED: CounterVec = register_counter_vec!(
        "iploan_messages_delivered_total",
        "Relay messages handled by a recipient",
        &["domain"]
    ).unwrap();

    pub static ref MESSAGES_DUPLICATE: CounterVec = register_counter_vec!(
        "iploan_messages_duplicate_total",
        "Relay redeliveries dropped by the inbox",
        &["domain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "iploan_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "iploan_transactions_failed_total",
        "Transactions reverted or never confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "iploan_transaction_latency_seconds",
        "Submission to receipt latency",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "iploan_wallet_balance_eth",
        "Wallet balance in ETH",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "iploan_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "iploan_health_check_failure_total",
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

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(domain: Domain, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&domain.to_string()])
        .set(block_number as f64);
}

pub fn record_event_received(domain: Domain, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&domain.to_string(), event_type])
        .inc();
}

pub fn record_loan_requested() {
    LOANS_REQUESTED.with_label_values(&[]).inc();
}

pub fn record_transition(from: &str, to: &str) {
    LOAN_TRANSITIONS.with_label_values(&[from, to]).inc();
}

pub fn set_loans_in_flight(count: usize) {
    LOANS_IN_FLIGHT.with_label_values(&[]).set(count as f64);
}

pub fn record_loan_halted() {
    LOANS_HALTED.with_label_values(&[]).inc();
}

pub fn record_loan_finished(outcome: &str, elapsed_secs: f64) {
    LOAN_TIME_TO_TERMINAL
        .with_label_values(&[outcome])
        .observe(elapsed_secs);
}

pub fn record_invariant_violation(kind: &str) {
    INVARIANT_VIOLATIONS.with_label_values(&[kind]).inc();
}

pub fn record_dispatch_attempt(kind: &str) {
    DISPATCH_ATTEMPTS.with_label_values(&[kind]).inc();
}

pub fn record_dispatch_failure(kind: &str, class: &str) {
    DISPATCH_FAILURES.with_label_values(&[kind, class]).inc();
}

pub fn record_release_stalled() {
    RELEASE_STALLED.with_label_values(&[]).inc();
}

pub fn record_message_delivered(domain: Domain) {
    MESSAGES_DELIVERED
        .with_label_values(&[&domain.to_string()])
        .inc();
}

pub fn record_message_duplicate(domain: Domain) {
    MESSAGES_DUPLICATE
        .with_label_values(&[&domain.to_string()])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_wallet_balance(chain_id: u64, balance_eth: f64) {
    WALLET_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .set(balance_eth);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exposition_includes_loan_metrics() {
        record_transition("requested", "collateral_locked");
        record_dispatch_failure("issue_loan", "transient");
        set_loans_in_flight(3);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("iploan_loan_transitions_total"));
        assert!(body.contains("from=\"requested\""));
        assert!(body.contains("iploan_dispatch_failures_total"));
        assert!(body.contains("iploan_loans_in_flight"));
    }
}
