//! CLI argument definitions using clap with subcommand architecture
//!
//! `serve` runs the service, `cert` provisions the TLS material on its own and
//! `client` opens an interactive session against a running server.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// Concurrent TCP/TLS command service
#[derive(Parser, Debug)]
#[command(name = "nethub")]
#[command(about = "Line-oriented JSON command service over TCP and TLS")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for nethub
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the plain and TLS listeners
    Serve(ServeArgs),

    /// Create the self-signed certificate if missing and print its paths
    Cert(CertArgs),

    /// Interactive client for a running server
    Client(ClientArgs),
}

// ============================================
// Serve
// ============================================

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Configuration file (defaults to <config dir>/nethub/config.toml)
    #[arg(short, long, env = "NETHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Only start the plain TCP listener
    #[arg(long, conflicts_with = "tls_only")]
    pub plain_only: bool,

    /// Only start the TLS listener
    #[arg(long)]
    pub tls_only: bool,

    /// Port for the plain TCP listener
    #[arg(long)]
    pub plain_port: Option<u16>,

    /// Port for the TLS listener
    #[arg(long)]
    pub tls_port: Option<u16>,

    /// Directory holding server.crt and server.key
    #[arg(long)]
    pub cert_dir: Option<PathBuf>,

    /// Record connections and events to this SQLite file
    #[arg(long)]
    pub sqlite: Option<PathBuf>,
}

impl ServeArgs {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if self.plain_only {
            config.plain.enabled = true;
            config.tls.enabled = false;
        }
        if self.tls_only {
            config.plain.enabled = false;
            config.tls.enabled = true;
        }
        if let Some(port) = self.plain_port {
            config.plain.port = port;
        }
        if let Some(port) = self.tls_port {
            config.tls.port = port;
        }
        if let Some(dir) = &self.cert_dir {
            config.tls.cert_dir = dir.clone();
        }
        if let Some(path) = &self.sqlite {
            config.storage.sqlite_path = Some(path.clone());
        }
    }
}

// ============================================
// Cert
// ============================================

#[derive(Args, Debug)]
pub struct CertArgs {
    /// Directory for server.crt and server.key
    #[arg(long, default_value = "certs")]
    pub cert_dir: PathBuf,
}

// ============================================
// Client
// ============================================

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port (9500 plain, 9502 with --tls)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connect over TLS
    #[arg(long)]
    pub tls: bool,

    /// Certificate to trust for --tls
    #[arg(long, default_value = "certs/server.crt")]
    pub ca: PathBuf,

    /// Name to verify in the server certificate
    #[arg(long, default_value = "localhost")]
    pub server_name: String,
}

impl ClientArgs {
    pub fn port(&self) -> u16 {
        match (self.port, self.tls) {
            (Some(port), _) => port,
            (None, true) => 9502,
            (None, false) => 9500,
        }
    }
}
