//! Prometheus metrics for the command service
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `nethub_connections_opened_total` | Counter | `transport` |
//! | `nethub_connections_closed_total` | Counter | `transport` |
//! | `nethub_active_connections` | Gauge | `transport` |
//! | `nethub_bytes_total` | Counter | `transport`, `direction` |
//! | `nethub_messages_received_total` | Counter | `transport` |
//! | `nethub_messages_sent_total` | Counter | `transport` |
//! | `nethub_errors_total` | Counter | `transport`, `error_type` |
//! | `nethub_ia_response_seconds` | Histogram | `model` |
//!
//! The registry is owned by [`Metrics`], so independent hosts (and tests) never
//! share counters.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::registry::TransportKind;

/// Buckets for the `ia` backend, which answers in seconds to minutes
pub const IA_RESPONSE_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Error categories used for the `error_type` label
pub mod error_type {
    pub const UNKNOWN_COMMAND: &str = "unknown_command";
    pub const PROTOCOL: &str = "protocol";
    pub const IO: &str = "io";
    pub const TLS_HANDSHAKE: &str = "tls_handshake";
    pub const IA: &str = "ia";
    pub const ACCEPT: &str = "accept";
    pub const STORE: &str = "store";
}

/// Direction label for byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Counters and gauges for one service host
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    connections_opened: IntCounterVec,
    connections_closed: IntCounterVec,
    active_connections: IntGaugeVec,
    bytes_total: IntCounterVec,
    messages_received: IntCounterVec,
    messages_sent: IntCounterVec,
    errors_total: IntCounterVec,
    ia_response: HistogramVec,
}

impl Metrics {
    /// Create every metric family on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_opened = IntCounterVec::new(
            Opts::new(
                "nethub_connections_opened_total",
                "Connections registered after accept (and handshake)",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(connections_opened.clone()))?;

        let connections_closed = IntCounterVec::new(
            Opts::new("nethub_connections_closed_total", "Connections closed"),
            &["transport"],
        )?;
        registry.register(Box::new(connections_closed.clone()))?;

        let active_connections = IntGaugeVec::new(
            Opts::new("nethub_active_connections", "Currently active connections"),
            &["transport"],
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let bytes_total = IntCounterVec::new(
            Opts::new("nethub_bytes_total", "Bytes transferred"),
            &["transport", "direction"],
        )?;
        registry.register(Box::new(bytes_total.clone()))?;

        let messages_received = IntCounterVec::new(
            Opts::new("nethub_messages_received_total", "Request lines received"),
            &["transport"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_sent = IntCounterVec::new(
            Opts::new("nethub_messages_sent_total", "Responses sent"),
            &["transport"],
        )?;
        registry.register(Box::new(messages_sent.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("nethub_errors_total", "Errors by category"),
            &["transport", "error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let ia_response = HistogramVec::new(
            HistogramOpts::new(
                "nethub_ia_response_seconds",
                "Time taken by the ia backend to answer",
            )
            .buckets(IA_RESPONSE_BUCKETS.to_vec()),
            &["model"],
        )?;
        registry.register(Box::new(ia_response.clone()))?;

        Ok(Self {
            registry,
            connections_opened,
            connections_closed,
            active_connections,
            bytes_total,
            messages_received,
            messages_sent,
            errors_total,
            ia_response,
        })
    }

    pub fn connection_opened(&self, transport: TransportKind) {
        let label = transport.as_str();
        self.connections_opened.with_label_values(&[label]).inc();
        self.active_connections.with_label_values(&[label]).inc();
    }

    pub fn connection_closed(&self, transport: TransportKind) {
        let label = transport.as_str();
        self.connections_closed.with_label_values(&[label]).inc();
        self.active_connections.with_label_values(&[label]).dec();
    }

    pub fn bytes(&self, transport: TransportKind, direction: Direction, n: usize) {
        self.bytes_total
            .with_label_values(&[transport.as_str(), direction.as_str()])
            .inc_by(n as u64);
    }

    pub fn message_received(&self, transport: TransportKind) {
        self.messages_received
            .with_label_values(&[transport.as_str()])
            .inc();
    }

    pub fn message_sent(&self, transport: TransportKind) {
        self.messages_sent
            .with_label_values(&[transport.as_str()])
            .inc();
    }

    /// Count one error; see [`error_type`] for the categories in use
    pub fn error(&self, transport: TransportKind, error_type: &str) {
        self.errors_total
            .with_label_values(&[transport.as_str(), error_type])
            .inc();
    }

    pub fn observe_ia(&self, model: &str, seconds: f64) {
        self.ia_response
            .with_label_values(&[model])
            .observe(seconds);
    }

    pub fn active(&self, transport: TransportKind) -> i64 {
        self.active_connections
            .with_label_values(&[transport.as_str()])
            .get()
    }

    pub fn errors(&self, transport: TransportKind, error_type: &str) -> u64 {
        self.errors_total
            .with_label_values(&[transport.as_str(), error_type])
            .get()
    }

    pub fn opened(&self, transport: TransportKind) -> u64 {
        self.connections_opened
            .with_label_values(&[transport.as_str()])
            .get()
    }

    /// Prometheus text exposition of every family
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
