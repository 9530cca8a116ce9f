//! Event sink
//!
//! Connection lifecycle events (connect, close, protocol errors, handshake
//! failures) are reported through [`EventSink`]. Sinks are fire-and-forget:
//! they must not block the session and cannot fail it.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Severity of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of connection lifecycle events
pub trait EventSink: Send + Sync {
    /// Record one event. Must return promptly and never panic.
    fn log_event(&self, level: EventLevel, service: &str, message: &str, peer: Option<IpAddr>);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log_event(&self, level: EventLevel, service: &str, message: &str, peer: Option<IpAddr>) {
        let peer = peer.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        match level {
            EventLevel::Debug => tracing::debug!(service, %peer, "{}", message),
            EventLevel::Info => tracing::info!(service, %peer, "{}", message),
            EventLevel::Warning => tracing::warn!(service, %peer, "{}", message),
            EventLevel::Error => tracing::error!(service, %peer, "{}", message),
        }
    }
}
