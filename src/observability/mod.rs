// observability/mod.rs - Tracing and Metrics

//! Structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig, TracingFormat};
//!
//! init_tracing(TracingConfig::for_level("debug", TracingFormat::Compact))?;
//! let handle = init_metrics(MetricsConfig::default())?;
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    init_metrics, record_agent_spawned, record_agent_stopped, record_behaviour_error,
    record_delivery_failure, record_message_dropped, record_message_received,
    record_message_sent, record_round_closed, record_round_decided, record_round_opened,
    record_subscriptions, AgentMetrics, MessageMetrics, MetricsConfig, MetricsHandle,
    ProtocolMetrics,
};

pub use tracing_setup::{init_tracing, TracingConfig, TracingFormat};
