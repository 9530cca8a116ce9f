//! Service host
//!
//! Starts one [`TransportListener`] per enabled transport and owns the
//! shutdown signal shared by all of them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ServiceHost                             │
//! │                                                                  │
//! │   certs/ ──► ensure_certificate ──► rustls ServerConfig          │
//! │                                             │                    │
//! │   TransportListener(tcp)      TransportListener(tcp_tls)         │
//! │        │ accept                      │ accept + handshake        │
//! │        ▼                             ▼                           │
//! │   run_session ×N              run_session ×N                     │
//! │        │                             │                           │
//! │        └──────► Dispatcher ◄─────────┘                           │
//! │                                                                  │
//! │   Arc<ConnectionRegistry>   Collaborators (sinks, metrics, store)│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A listener that fails to start does not stop the others; the failure is
//! remembered and turned into a non-zero exit once the host stops.

pub mod listener;
pub mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ai::{AiBackend, DisabledBackend, OllamaBackend};
use crate::collab::{Collaborators, EventLevel, Metrics, SqliteStore};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{NethubError, Result};
use crate::registry::{ConnectionRegistry, TransportKind};
use crate::tls::{ensure_certificate, server_config, CertPaths};

pub use listener::{ListenerTimeouts, TransportListener};
pub use session::{run_session, Accepted, SessionSettings, SessionShared};

/// Everything a host needs besides its configuration
pub struct ServiceHost {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    collab: Collaborators,
    ai: Arc<dyn AiBackend>,
}

impl ServiceHost {
    /// Build collaborators from `config`
    ///
    /// Opens the SQLite store when one is configured; failing to open it is a
    /// startup error.
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let mut collab = Collaborators::new(metrics);

        if let Some(path) = &config.storage.sqlite_path {
            let store = SqliteStore::open(path).map_err(|e| NethubError::Storage {
                message: format!("{}: {}", path.display(), e),
            })?;
            tracing::info!("Recording connections to {}", path.display());
            collab = collab.with_sqlite(store);
        }

        let ai: Arc<dyn AiBackend> = if config.ia.enabled {
            let backend = OllamaBackend::new(
                &config.ia.endpoint,
                &config.ia.model,
                Duration::from_secs(config.ia.timeout_secs),
            )
            .map_err(|e| NethubError::ConfigError {
                message: format!("ia backend: {}", e),
            })?;
            Arc::new(backend)
        } else {
            Arc::new(DisabledBackend)
        };

        Ok(Self::with_parts(config, collab, ai))
    }

    /// Assemble a host from explicit collaborators
    pub fn with_parts(config: Config, collab: Collaborators, ai: Arc<dyn AiBackend>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.session.max_closed_records));
        Self {
            config,
            registry,
            collab,
            ai,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.collab.metrics)
    }

    /// Bind every enabled listener and start accepting
    pub async fn start(self) -> RunningHost {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeouts = ListenerTimeouts {
            handshake: Duration::from_secs(self.config.tls.handshake_timeout_secs),
            drain: Duration::from_secs(self.config.session.drain_timeout_secs),
        };

        let mut running = RunningHost {
            plain_addr: None,
            tls_addr: None,
            cert_paths: None,
            failures: Vec::new(),
            requested: 0,
            tasks: Vec::new(),
            shutdown_tx,
            registry: Arc::clone(&self.registry),
            collab: self.collab.clone(),
        };

        if self.config.plain.enabled {
            running.requested += 1;
            let addr = SocketAddr::new(self.config.plain.bind, self.config.plain.port);
            let shared = self.shared_for(TransportKind::PlainTcp);
            match TransportListener::bind(addr, TransportKind::PlainTcp, None, timeouts).await {
                Ok(listener) => {
                    running.plain_addr = Some(listener.local_addr());
                    running.spawn(listener, shared, shutdown_rx.clone());
                }
                Err(e) => running.startup_failed(TransportKind::PlainTcp, e),
            }
        }

        if self.config.tls.enabled {
            running.requested += 1;
            match self.prepare_tls().await {
                Ok((paths, config)) => {
                    running.cert_paths = Some(paths);
                    let addr = SocketAddr::new(self.config.tls.bind, self.config.tls.port);
                    let shared = self.shared_for(TransportKind::TlsTcp);
                    let bound = TransportListener::bind(
                        addr,
                        TransportKind::TlsTcp,
                        Some(config),
                        timeouts,
                    )
                    .await;
                    match bound {
                        Ok(listener) => {
                            running.tls_addr = Some(listener.local_addr());
                            running.spawn(listener, shared, shutdown_rx.clone());
                        }
                        Err(e) => running.startup_failed(TransportKind::TlsTcp, e),
                    }
                }
                Err(e) => running.startup_failed(TransportKind::TlsTcp, e),
            }
        }

        running
    }

    async fn prepare_tls(&self) -> Result<(CertPaths, Arc<rustls::ServerConfig>)> {
        let dir: PathBuf = self.config.tls.cert_dir.clone();
        // RSA key generation is CPU-bound
        let paths = tokio::task::spawn_blocking(move || ensure_certificate(&dir))
            .await
            .map_err(|e| NethubError::TlsConfig {
                message: format!("certificate task failed: {}", e),
            })??;
        let config = server_config(&paths)?;
        Ok((paths, config))
    }

    fn shared_for(&self, transport: TransportKind) -> Arc<SessionShared> {
        let unknown_status = match transport {
            TransportKind::PlainTcp => self.config.plain.unknown_command_status,
            TransportKind::TlsTcp => self.config.tls.unknown_command_status,
        };
        let dispatcher = Dispatcher::new(Arc::clone(&self.ai), Arc::clone(&self.collab.metrics))
            .with_close_commands(self.config.close_commands())
            .with_unknown_status(unknown_status)
            .with_ai_timeout(Duration::from_secs(self.config.ia.timeout_secs));

        Arc::new(SessionShared {
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::new(dispatcher),
            collab: self.collab.clone(),
            settings: self.config.session_settings(),
        })
    }
}

/// Listeners started by [`ServiceHost::start`]
pub struct RunningHost {
    pub plain_addr: Option<SocketAddr>,
    pub tls_addr: Option<SocketAddr>,
    pub cert_paths: Option<CertPaths>,
    failures: Vec<(TransportKind, NethubError)>,
    requested: usize,
    tasks: Vec<(TransportKind, JoinHandle<Result<()>>)>,
    shutdown_tx: watch::Sender<bool>,
    registry: Arc<ConnectionRegistry>,
    collab: Collaborators,
}

impl RunningHost {
    fn spawn(
        &mut self,
        listener: TransportListener,
        shared: Arc<SessionShared>,
        shutdown: watch::Receiver<bool>,
    ) {
        let transport = listener.transport();
        self.collab.log_event(
            EventLevel::Info,
            transport.as_str(),
            &format!("Servidor escuchando en {}", listener.local_addr()),
            None,
        );
        self.tasks
            .push((transport, tokio::spawn(listener.run(shared, shutdown))));
    }

    fn startup_failed(&mut self, transport: TransportKind, err: NethubError) {
        tracing::error!("{} listener failed to start: {}", transport, err);
        self.collab.log_event(
            EventLevel::Error,
            transport.as_str(),
            &format!("No se pudo iniciar el servidor: {}", err),
            None,
        );
        self.failures.push((transport, err));
    }

    /// Number of listeners currently accepting
    pub fn listening(&self) -> usize {
        self.tasks.len()
    }

    /// Startup errors, per transport
    pub fn failures(&self) -> &[(TransportKind, NethubError)] {
        &self.failures
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.collab.metrics)
    }

    /// Run until `signal` resolves, then stop and drain
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        tracing::info!("Shutdown requested");
        self.shutdown().await
    }

    /// Stop accepting, drain sessions and report the exit status
    ///
    /// `Ok(())` only when every requested listener started and none died.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let mut lost: Option<NethubError> = None;
        for (transport, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => tracing::debug!("{} listener stopped", transport),
                Ok(Err(e)) => {
                    tracing::error!("{} listener stopped with error: {}", transport, e);
                    lost.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("{} listener task failed: {}", transport, e);
                    lost.get_or_insert(NethubError::ListenerLost {
                        addr: transport.to_string(),
                        source: std::io::Error::other(e.to_string()),
                    });
                }
            }
        }

        let stats = self.registry.stats();
        tracing::info!(
            "Stopped: {} connection(s) served, {} bytes sent, {} bytes received",
            stats.total_opened,
            stats.bytes_sent,
            stats.bytes_received
        );
        tracing::debug!("Final metrics:\n{}", self.collab.metrics.render());

        if let Some(e) = lost {
            return Err(e);
        }
        if !self.failures.is_empty() {
            return Err(NethubError::StartupIncomplete {
                failed: self.failures.len(),
                requested: self.requested,
            });
        }
        Ok(())
    }
}
