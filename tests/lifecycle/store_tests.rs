//! SQLite connection and event records

use std::path::Path;
use std::time::Duration;

use nethub::collab::StoredConnection;
use nethub::SqliteStore;

use crate::common::{wait_for_closed, TestHost};

/// Poll the store until row `id` is marked closed
async fn closed_row(path: &Path, id: i64) -> StoredConnection {
    let store = SqliteStore::open(path).unwrap();
    for _ in 0..250 {
        if let Some(row) = store.fetch_connection(id).await.unwrap() {
            if row.estado == "CERRADA" {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection row {id} never closed");
}

#[tokio::test]
async fn test_plain_connection_is_stored() {
    let db_dir = tempfile::tempdir().unwrap();
    let db = db_dir.path().join("nethub.db");
    let host = TestHost::start_with(|config| {
        config.tls.enabled = false;
        config.storage.sqlite_path = Some(db.clone());
    })
    .await;

    let mut client = host.plain_client().await;
    client.send("ping").await.unwrap();
    client.send("exit").await.unwrap();

    let record = wait_for_closed(host.registry(), 1).await.remove(0);
    let row = closed_row(&db, 1).await;
    assert_eq!(row.tipo, "TCP");
    assert_eq!(row.ip_cliente, "127.0.0.1");
    assert_eq!(row.puerto_cliente, record.peer_port);
    assert_eq!(row.bytes_enviados, record.bytes_sent);
    assert_eq!(row.bytes_recibidos, record.bytes_received);
    assert!(row.timestamp_fin.is_some());
    assert!(row.cipher.is_none());

    host.shutdown().await.unwrap();

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.count_connections().await.unwrap(), 1);
    assert!(store.count_logs(Some("tcp")).await.unwrap() >= 2);
}

#[tokio::test]
async fn test_tls_connection_row_carries_cipher() {
    let db_dir = tempfile::tempdir().unwrap();
    let db = db_dir.path().join("nethub.db");
    let host = TestHost::start_with(|config| {
        config.plain.enabled = false;
        config.storage.sqlite_path = Some(db.clone());
    })
    .await;

    let mut client = host.tls_client().await;
    let negotiated = client.tls_info().cloned().unwrap();
    client.send("quit").await.unwrap();

    let row = closed_row(&db, 1).await;
    assert_eq!(row.tipo, "TCP_TLS");
    assert_eq!(row.cipher, Some(negotiated.cipher));
    assert_eq!(row.tls_version, Some(negotiated.protocol_version));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handshake_failures_are_logged_not_stored() {
    let db_dir = tempfile::tempdir().unwrap();
    let db = db_dir.path().join("nethub.db");
    let host = TestHost::start_with(|config| {
        config.plain.enabled = false;
        config.storage.sqlite_path = Some(db.clone());
    })
    .await;

    let raw = tokio::net::TcpStream::connect(host.tls_addr()).await.unwrap();
    drop(raw);

    let store = SqliteStore::open(&db).unwrap();
    let mut logged = false;
    for _ in 0..250 {
        // startup notice plus the failed handshake
        if store.count_logs(Some("tcp_tls")).await.unwrap() >= 2 {
            logged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(logged);
    assert_eq!(store.count_connections().await.unwrap(), 0);

    host.shutdown().await.unwrap();
}
