//! Service configuration
//!
//! Loaded from TOML. Lookup order:
//! 1. The path given with `--config` (must exist)
//! 2. `<config dir>/nethub/config.toml` (e.g. `~/.config/nethub/config.toml`)
//! 3. Built-in defaults
//!
//! Every section and field is optional; missing values take the defaults
//! below. CLI flags are applied on top by the binary.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::UnknownCommandStatus;
use crate::error::{NethubError, Result};
use crate::protocol::{CloseCommands, DEFAULT_MAX_LINE_BYTES};
use crate::registry::DEFAULT_MAX_CLOSED_RECORDS;
use crate::server::session::SessionSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub plain: PlainConfig,
    pub tls: TlsConfig,
    pub session: SessionConfig,
    pub ia: IaConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the `nethub` target when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlainConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub unknown_command_status: UnknownCommandStatus,
}

impl Default for PlainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9500,
            unknown_command_status: UnknownCommandStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    /// Directory holding `server.crt` / `server.key`, relative to the
    /// working directory unless absolute
    pub cert_dir: PathBuf,
    pub unknown_command_status: UnknownCommandStatus,
    pub handshake_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9502,
            cert_dir: PathBuf::from("certs"),
            unknown_command_status: UnknownCommandStatus::Error,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub close_commands: Vec<String>,
    pub max_line_bytes: usize,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    pub drain_timeout_secs: u64,
    pub max_closed_records: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_commands: CloseCommands::default().words().to_vec(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
            drain_timeout_secs: 5,
            max_closed_records: DEFAULT_MAX_CLOSED_RECORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IaConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for IaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama2".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file for connection rows and events; disabled when unset
    pub sqlite_path: Option<PathBuf>,
}

impl Config {
    /// Resolve and load the configuration
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(NethubError::ConfigError {
                    message: format!("Config file not found: {}", path.display()),
                });
            }
            return Self::load_from(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/nethub/config.toml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nethub").join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| NethubError::IoError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| NethubError::ConfigError {
            message: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.max_line_bytes == 0 {
            return Err(NethubError::ConfigError {
                message: "session.max_line_bytes must be greater than zero".to_string(),
            });
        }
        if self.close_commands().words().is_empty() {
            return Err(NethubError::ConfigError {
                message: "session.close_commands must name at least one command".to_string(),
            });
        }
        if self.tls.handshake_timeout_secs == 0 {
            return Err(NethubError::ConfigError {
                message: "tls.handshake_timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.ia.timeout_secs == 0 {
            return Err(NethubError::ConfigError {
                message: "ia.timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn close_commands(&self) -> CloseCommands {
        CloseCommands::new(&self.session.close_commands)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            max_line_bytes: self.session.max_line_bytes,
            idle_timeout: self
                .session
                .idle_timeout_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            max_lifetime: self
                .session
                .max_lifetime_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        }
    }
}
