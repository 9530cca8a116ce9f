//! Service host running on ephemeral ports for a single test

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nethub::{
    AiBackend, Collaborators, CommandClient, Config, ConnectionRegistry, Metrics, RunningHost,
    ServiceHost,
};
use tempfile::TempDir;

/// Listeners bound to `127.0.0.1:0`, torn down by [`TestHost::shutdown`]
pub struct TestHost {
    running: RunningHost,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    dir: TempDir,
}

impl TestHost {
    /// Loopback-only config with both transports, ia disabled and certs in `dir`
    pub fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.plain.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.plain.port = 0;
        config.tls.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.tls.port = 0;
        config.tls.cert_dir = dir.join("certs");
        config.ia.enabled = false;
        config.session.drain_timeout_secs = 1;
        config
    }

    /// Start both listeners with the default test config
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Plain listener only; skips key generation
    pub async fn start_plain() -> Self {
        Self::start_with(|config| config.tls.enabled = false).await
    }

    /// Start with a config adjusted by `customize`
    pub async fn start_with(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Self::config(dir.path());
        customize(&mut config);

        let host = ServiceHost::new(config).expect("Failed to build host");
        Self::launch(host, dir).await
    }

    /// Plain listener with an explicit ia backend
    pub async fn start_with_ai(ai: Arc<dyn AiBackend>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Self::config(dir.path());
        config.tls.enabled = false;
        let metrics = Arc::new(Metrics::new().expect("Failed to build metrics"));
        let host = ServiceHost::with_parts(config, Collaborators::new(metrics), ai);
        Self::launch(host, dir).await
    }

    async fn launch(host: ServiceHost, dir: TempDir) -> Self {
        let registry = host.registry();
        let metrics = host.metrics();
        let running = host.start().await;
        Self {
            running,
            registry,
            metrics,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn running(&self) -> &RunningHost {
        &self.running
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Registry that outlives [`TestHost::shutdown`]
    pub fn registry_handle(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics_handle(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn plain_addr(&self) -> SocketAddr {
        self.running.plain_addr.expect("plain listener not running")
    }

    pub fn tls_addr(&self) -> SocketAddr {
        self.running.tls_addr.expect("TLS listener not running")
    }

    /// Certificate the TLS listener serves, used as the client trust anchor
    pub fn ca_cert(&self) -> PathBuf {
        self.running
            .cert_paths
            .as_ref()
            .expect("TLS material not provisioned")
            .cert
            .clone()
    }

    pub async fn plain_client(&self) -> CommandClient {
        CommandClient::connect_plain(self.plain_addr())
            .await
            .expect("plain connect failed")
    }

    pub async fn tls_client(&self) -> CommandClient {
        CommandClient::connect_tls(self.tls_addr(), "localhost", &self.ca_cert())
            .await
            .expect("TLS connect failed")
    }

    pub async fn shutdown(self) -> nethub::Result<()> {
        self.running.shutdown().await
    }
}
