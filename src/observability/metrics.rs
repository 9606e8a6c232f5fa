// observability/metrics.rs - Prometheus counters for agents and rounds

use axum::{extract::State, routing::get, Json, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Exporter settings
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Where `/metrics` and `/health` are served
    pub listen_addr: SocketAddr,

    /// Buckets for the CFP-to-decision histogram, in seconds
    pub decision_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            // Collection windows are seconds long; early decisions are faster
            decision_buckets: vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0],
        }
    }
}

/// Installed recorder
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Current values in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

pub struct AgentMetrics;

impl AgentMetrics {
    pub const SPAWNED_TOTAL: &'static str = "cnet_agents_spawned_total";
    pub const STOPPED_TOTAL: &'static str = "cnet_agents_stopped_total";
    pub const ACTIVE: &'static str = "cnet_agents_active";
    pub const HANDLER_ERRORS_TOTAL: &'static str = "cnet_behaviour_errors_total";
}

pub struct MessageMetrics;

impl MessageMetrics {
    pub const SENT_TOTAL: &'static str = "cnet_messages_sent_total";
    pub const RECEIVED_TOTAL: &'static str = "cnet_messages_received_total";
    pub const DELIVERY_FAILURES_TOTAL: &'static str = "cnet_delivery_failures_total";
    pub const DROPPED_TOTAL: &'static str = "cnet_messages_dropped_total";
}

/// Contract-net rounds and subscriptions
pub struct ProtocolMetrics;

impl ProtocolMetrics {
    pub const ROUNDS_OPENED_TOTAL: &'static str = "cnet_rounds_opened_total";
    pub const ROUNDS_DECIDED_TOTAL: &'static str = "cnet_rounds_decided_total";
    pub const ROUNDS_CLOSED_TOTAL: &'static str = "cnet_rounds_closed_total";
    pub const DECISION_SECONDS: &'static str = "cnet_round_decision_seconds";
    pub const SUBSCRIPTIONS: &'static str = "cnet_subscriptions";
}

/// Install the Prometheus recorder and serve it over HTTP.
///
/// Must be called from inside a Tokio runtime. Until this runs every
/// `record_*` call is a no-op.
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(ProtocolMetrics::DECISION_SECONDS.to_string()),
            &config.decision_buckets,
        )?
        .install_recorder()?;
    describe_all();

    let exporter = MetricsHandle { handle };
    tokio::spawn(serve(config.listen_addr, exporter.clone()));
    Ok(exporter)
}

#[derive(Clone)]
struct Exporter {
    metrics: MetricsHandle,
    started: Instant,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn render_metrics(State(exporter): State<Exporter>) -> String {
    exporter.metrics.render()
}

async fn health(State(exporter): State<Exporter>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: exporter.started.elapsed().as_secs(),
    })
}

async fn serve(addr: SocketAddr, metrics: MetricsHandle) {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .with_state(Exporter {
            metrics,
            started: Instant::now(),
        });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Metrics endpoint could not bind");
            return;
        }
    };
    info!(addr = %addr, "Serving metrics");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics endpoint failed");
    }
}

fn describe_all() {
    describe_counter!(AgentMetrics::SPAWNED_TOTAL, "Agents started");
    describe_counter!(AgentMetrics::STOPPED_TOTAL, "Agents stopped");
    describe_gauge!(AgentMetrics::ACTIVE, "Agents currently running");
    describe_counter!(AgentMetrics::HANDLER_ERRORS_TOTAL, "Behaviour callbacks that returned an error");

    describe_counter!(MessageMetrics::SENT_TOTAL, "ACL messages sent");
    describe_counter!(MessageMetrics::RECEIVED_TOTAL, "ACL messages decoded from the wire");
    describe_counter!(MessageMetrics::DELIVERY_FAILURES_TOTAL, "Frames that never reached their receiver");
    describe_counter!(MessageMetrics::DROPPED_TOTAL, "Messages discarded, labelled by reason");

    describe_counter!(ProtocolMetrics::ROUNDS_OPENED_TOTAL, "Calls for proposals issued");
    describe_counter!(ProtocolMetrics::ROUNDS_DECIDED_TOTAL, "Rounds that reached a decision");
    describe_counter!(ProtocolMetrics::ROUNDS_CLOSED_TOTAL, "Rounds finished or expired");
    describe_histogram!(ProtocolMetrics::DECISION_SECONDS, "Seconds from CFP to decision");
    describe_gauge!(ProtocolMetrics::SUBSCRIPTIONS, "Subscribers per topic");
}

pub fn record_agent_spawned() {
    counter!(AgentMetrics::SPAWNED_TOTAL).increment(1);
    gauge!(AgentMetrics::ACTIVE).increment(1.0);
}

pub fn record_agent_stopped(reason: &str) {
    counter!(AgentMetrics::STOPPED_TOTAL, "reason" => reason.to_string()).increment(1);
    gauge!(AgentMetrics::ACTIVE).decrement(1.0);
}

pub fn record_behaviour_error(behaviour: &str) {
    counter!(AgentMetrics::HANDLER_ERRORS_TOTAL, "behaviour" => behaviour.to_string()).increment(1);
}

pub fn record_message_sent(performative: &str, protocol: &str) {
    counter!(
        MessageMetrics::SENT_TOTAL,
        "performative" => performative.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
}

pub fn record_message_received(performative: &str, protocol: &str) {
    counter!(
        MessageMetrics::RECEIVED_TOTAL,
        "performative" => performative.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
}

pub fn record_delivery_failure(performative: &str) {
    counter!(MessageMetrics::DELIVERY_FAILURES_TOTAL, "performative" => performative.to_string()).increment(1);
}

/// `reason` is one of `unroutable`, `unclaimed`, `invalid`, `decode`
pub fn record_message_dropped(reason: &str) {
    counter!(MessageMetrics::DROPPED_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_round_opened() {
    counter!(ProtocolMetrics::ROUNDS_OPENED_TOTAL).increment(1);
}

pub fn record_round_decided(latency: Duration, had_winner: bool) {
    let label = if had_winner { "awarded" } else { "no_bids" };
    counter!(ProtocolMetrics::ROUNDS_DECIDED_TOTAL, "result" => label).increment(1);
    histogram!(ProtocolMetrics::DECISION_SECONDS).record(latency.as_secs_f64());
}

/// `outcome` is `completed`, `expired` or `no_winner`
pub fn record_round_closed(outcome: &str) {
    counter!(ProtocolMetrics::ROUNDS_CLOSED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_subscriptions(topic: &str, count: usize) {
    gauge!(ProtocolMetrics::SUBSCRIPTIONS, "topic" => topic.to_string()).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_buckets_cover_collection_window() {
        let config = MetricsConfig::default();
        assert!(config.decision_buckets.windows(2).all(|w| w[0] < w[1]));
        assert!(config.decision_buckets.iter().any(|&b| b >= 5.0));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_message_sent("CFP", "fipa-contract-net");
        record_round_decided(Duration::from_millis(5), true);
        record_message_dropped("unroutable");
        record_subscriptions("machine", 3);
    }
}
