//! Collaborators consumed by sessions
//!
//! Sessions report to three narrow interfaces: an [`EventSink`] fan-out, the
//! [`Metrics`] registry and an optional [`ConnectionStore`]. None of them can
//! fail a session; errors are logged and dropped.

pub mod metrics;
pub mod sink;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;

pub use metrics::{Direction, Metrics};
pub use sink::{EventLevel, EventSink, TracingSink};
pub use store::{ConnectionStore, SqliteStore, StoreError, StoredConnection};

/// Everything a session reports to
#[derive(Clone)]
pub struct Collaborators {
    sinks: Vec<Arc<dyn EventSink>>,
    pub metrics: Arc<Metrics>,
    pub store: Option<Arc<dyn ConnectionStore>>,
}

impl Collaborators {
    /// Tracing sink only, no store
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sinks: vec![Arc::new(TracingSink)],
            metrics,
            store: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Persist connection rows and log events to `store`
    pub fn with_sqlite(mut self, store: SqliteStore) -> Self {
        let store = Arc::new(store);
        self.sinks.push(store.clone());
        self.store = Some(store as Arc<dyn ConnectionStore>);
        self
    }

    /// Fan an event out to every sink
    pub fn log_event(&self, level: EventLevel, service: &str, message: &str, peer: Option<IpAddr>) {
        for sink in &self.sinks {
            sink.log_event(level, service, message, peer);
        }
    }
}
