//! NetHub: concurrent TCP/TLS command service
//!
//! Clients connect over plain TCP or TLS, receive a welcome message and then
//! exchange newline-delimited JSON: one command line in, one JSON object out.
//! Every connection is tracked in a shared [`ConnectionRegistry`] and reported
//! to the event sink, metrics and (optionally) SQLite collaborators.
//!
//! # Example
//!
//! ```ignore
//! use nethub::{Config, ServiceHost};
//!
//! let host = ServiceHost::new(Config::default())?;
//! let running = host.start().await;
//! running.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

pub mod ai;
pub mod cli;
pub mod client;
pub mod collab;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tls;

// Re-export commonly used types
pub use ai::{AiBackend, AiError, DisabledBackend, OllamaBackend};
pub use cli::Cli;
pub use client::{ClientError, CommandClient};
pub use collab::{Collaborators, EventLevel, EventSink, Metrics, SqliteStore};
pub use config::Config;
pub use dispatch::{Dispatcher, UnknownCommandStatus};
pub use error::{NethubError, Result};
pub use protocol::{CommandResponse, Payload, Status};
pub use registry::{
    CloseReason, ConnectionId, ConnectionRecord, ConnectionRegistry, ConnectionState, TlsInfo,
    TransportKind,
};
pub use server::{RunningHost, ServiceHost};
