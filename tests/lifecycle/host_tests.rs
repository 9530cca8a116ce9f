//! Startup, shutdown and certificate provisioning

use std::time::Duration;

use tokio::net::TcpStream;

use nethub::tls::{ensure_certificate, CertPaths};
use nethub::{CloseReason, Config, NethubError, ServiceHost, TransportKind};

use crate::common::{wait_for, TestHost};

#[tokio::test]
async fn test_shutdown_cancels_open_sessions() {
    let host = TestHost::start_plain().await;
    let registry = host.registry_handle();
    let addr = host.plain_addr();

    let mut idle = host.plain_client().await;
    let started = tokio::time::Instant::now();
    host.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let records = registry.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].close_reason, Some(CloseReason::Shutdown));
    assert_eq!(registry.active_count(None), 0);

    // the session is gone and nothing listens any more
    assert!(idle.at_eof().await.unwrap_or(true));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_clean_shutdown_without_clients() {
    let host = TestHost::start().await;
    assert_eq!(host.running().listening(), 2);
    assert!(host.running().failures().is_empty());
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_failed_listener_does_not_stop_the_other() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let host = TestHost::start_with(|config| config.plain.port = taken).await;
    assert_eq!(host.running().listening(), 1);
    assert!(host.running().plain_addr.is_none());

    let failures = host.running().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, TransportKind::PlainTcp);
    assert!(matches!(failures[0].1, NethubError::Bind { .. }));

    // TLS keeps serving
    let mut client = host.tls_client().await;
    assert_eq!(client.send("ping").await.unwrap().message(), Some("pong"));
    drop(client);

    let err = host.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        NethubError::StartupIncomplete {
            failed: 1,
            requested: 2
        }
    ));
    assert_ne!(err.code(), 0);
    drop(blocker);
}

#[tokio::test]
async fn test_no_listener_at_all() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let host = TestHost::start_with(|config| {
        config.plain.port = taken;
        config.tls.enabled = false;
    })
    .await;
    assert_eq!(host.running().listening(), 0);

    let err = host.shutdown().await.unwrap_err();
    assert_eq!(err.code(), 6);
}

#[tokio::test]
async fn test_unwritable_storage_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TestHost::config(dir.path());
    config.storage.sqlite_path = Some(dir.path().join("missing").join("dir").join("n.db"));

    let err = ServiceHost::new(config).err().expect("storage should fail");
    assert!(matches!(err, NethubError::Storage { .. }));
    assert_eq!(err.code(), 5);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_start() {
    let err = Config::from_toml_str("[session]\nmax_line_bytes = 0").unwrap_err();
    assert_eq!(err.code(), 2);
}

#[tokio::test]
async fn test_metrics_follow_connection_lifecycle() {
    let host = TestHost::start_plain().await;
    let metrics = host.metrics_handle();

    let mut client = host.plain_client().await;
    client.send("ping").await.unwrap();
    assert_eq!(metrics.opened(TransportKind::PlainTcp), 1);
    assert_eq!(metrics.active(TransportKind::PlainTcp), 1);

    client.send("exit").await.unwrap();
    wait_for(|| (metrics.active(TransportKind::PlainTcp) == 0).then_some(())).await;

    let text = metrics.render();
    assert!(text.contains("nethub_connections_closed_total"));
    assert!(text.contains("nethub_messages_received_total"));
    assert!(text.contains(r#"direction="received""#));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_provisioning_yields_one_pair() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("certs");

    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking({
            let path = path.clone();
            move || ensure_certificate(&path)
        }),
        tokio::task::spawn_blocking({
            let path = path.clone();
            move || ensure_certificate(&path)
        }),
    );
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert_eq!(a, b);
    assert_eq!(a, CertPaths::in_dir(&path));

    let cert = std::fs::read(&a.cert).unwrap();
    let key = std::fs::read(&a.key).unwrap();

    // later calls reuse the pair untouched
    ensure_certificate(&path).unwrap();
    assert_eq!(std::fs::read(&a.cert).unwrap(), cert);
    assert_eq!(std::fs::read(&a.key).unwrap(), key);
    assert_eq!(std::fs::read_dir(&path).unwrap().count(), 2);
}
