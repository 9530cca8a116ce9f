//! Error types and exit codes for nethub

use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

use crate::tls::CertError;

/// Main error type for nethub startup and host operations
///
/// Per-connection failures never surface here; they are reported through the
/// event sink and metrics only.
#[derive(Error, Debug)]
pub enum NethubError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Failed to read {path}: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate provisioning failed: {0}")]
    Certificate(#[from] CertError),

    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },

    #[error("Listener on {addr} stopped: {source}")]
    ListenerLost {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("{failed} of {requested} listener(s) failed to start")]
    StartupIncomplete { failed: usize, requested: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NethubError {
    /// Numeric exit status for this error:
    /// - 0: Success (never produced here)
    /// - 1: IO / generic failure
    /// - 2: Configuration error
    /// - 3: Bind failure
    /// - 4: Certificate or TLS setup failure
    /// - 5: Storage failure
    /// - 6: A listener died or some listeners never started
    pub fn code(&self) -> u8 {
        match self {
            Self::ConfigError { .. } => 2,
            Self::IoError { .. } => 1,
            Self::Bind { .. } => 3,
            Self::Certificate(_) => 4,
            Self::TlsConfig { .. } => 4,
            Self::Storage { .. } => 5,
            Self::Metrics(_) => 1,
            Self::ListenerLost { .. } => 6,
            Self::StartupIncomplete { .. } => 6,
            Self::Io(_) => 1,
        }
    }

    /// Convert error to a process exit code
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

/// Result type alias for nethub operations
pub type Result<T> = std::result::Result<T, NethubError>;
