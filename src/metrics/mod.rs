//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Source scanning (watermark, events, duplicates, reorgs)
//! - Destination transactions (submissions, replacements, outcomes)
//! - Backpressure (records in flight) and chain heads

use crate::error::RelayerResult;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_head",
        "Latest block height seen per chain",
        &["chain_id"]
    ).expect("chain head gauge");

    // Source metrics
    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "bridge_relayer_watermark",
        "Highest source block fully scanned",
        &["direction"]
    ).expect("watermark gauge");

    pub static ref EVENTS_SEEN: CounterVec = register_counter_vec!(
        "bridge_relayer_events_seen_total",
        "New bridge events recorded",
        &["direction"]
    ).expect("events counter");

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "bridge_relayer_events_duplicate_total",
        "Bridge events delivered again after being recorded",
        &["direction"]
    ).expect("duplicates counter");

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "bridge_relayer_reorgs_total",
        "Committed source blocks found replaced",
        &["direction"]
    ).expect("reorg counter");

    pub static ref EVENTS_ORPHANED: CounterVec = register_counter_vec!(
        "bridge_relayer_events_orphaned_total",
        "Recorded events that vanished in a reorg",
        &["direction"]
    ).expect("orphan counter");

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_submitted_total",
        "Mint transactions broadcast",
        &["direction"]
    ).expect("submitted counter");

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_replaced_total",
        "Same-nonce replacements of stuck mints",
        &["direction"]
    ).expect("replaced counter");

    pub static ref TX_REJECTED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_rejected_total",
        "Mints refused before broadcast",
        &["direction"]
    ).expect("rejected counter");

    pub static ref TX_REVERTED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_reverted_total",
        "Mints mined with a failed status",
        &["direction"]
    ).expect("reverted counter");

    pub static ref RELAYS_CONFIRMED: CounterVec = register_counter_vec!(
        "bridge_relayer_relays_confirmed_total",
        "Records that reached Confirmed",
        &["direction"]
    ).expect("confirmed counter");

    pub static ref RELAYS_ABANDONED: CounterVec = register_counter_vec!(
        "bridge_relayer_relays_abandoned_total",
        "Records that reached Abandoned",
        &["direction"]
    ).expect("abandoned counter");

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_relayer_relay_latency_seconds",
        "Time from observing an event to its confirmed mint",
        &["direction"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).expect("latency histogram");

    pub static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "bridge_relayer_in_flight",
        "Records currently between dispatch and settlement",
        &["direction"]
    ).expect("in-flight gauge");
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

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_chain_head(chain_id: u64, height: u64) {
    CHAIN_HEAD
        .with_label_values(&[&chain_id.to_string()])
        .set(height as f64);
}

pub fn record_watermark(direction: &str, block: u64) {
    WATERMARK.with_label_values(&[direction]).set(block as f64);
}

pub fn record_event_seen(direction: &str) {
    EVENTS_SEEN.with_label_values(&[direction]).inc();
}

pub fn record_duplicate_event(direction: &str) {
    EVENTS_DUPLICATE.with_label_values(&[direction]).inc();
}

pub fn record_reorg(direction: &str) {
    REORGS.with_label_values(&[direction]).inc();
}

pub fn record_orphaned(direction: &str) {
    EVENTS_ORPHANED.with_label_values(&[direction]).inc();
}

pub fn record_tx_submitted(direction: &str) {
    TX_SUBMITTED.with_label_values(&[direction]).inc();
}

pub fn record_tx_replaced(direction: &str) {
    TX_REPLACED.with_label_values(&[direction]).inc();
}

pub fn record_submission_failed(direction: &str) {
    TX_REJECTED.with_label_values(&[direction]).inc();
}

pub fn record_reverted(direction: &str) {
    TX_REVERTED.with_label_values(&[direction]).inc();
}

pub fn record_confirmed(direction: &str, latency_secs: f64) {
    RELAYS_CONFIRMED.with_label_values(&[direction]).inc();
    RELAY_LATENCY
        .with_label_values(&[direction])
        .observe(latency_secs);
}

pub fn record_abandoned(direction: &str) {
    RELAYS_ABANDONED.with_label_values(&[direction]).inc();
}

pub fn record_in_flight(direction: &str, count: usize) {
    IN_FLIGHT.with_label_values(&[direction]).set(count as f64);
}
