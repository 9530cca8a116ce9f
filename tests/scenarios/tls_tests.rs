//! TLS transport

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nethub::client::ClientError;
use nethub::tls::policy::version_rank;
use nethub::tls::{allowed_cipher_names, ensure_certificate, MIN_PROTOCOL_VERSION};
use nethub::{CloseReason, CommandClient, Payload, Status, TransportKind};

use crate::common::{assert_ok_text, wait_for, wait_for_closed, TestHost};

fn assert_acceptable_version(version: &str) {
    assert!(
        version == "TLSv1.2" || version == "TLSv1.3",
        "negotiated {version}"
    );
    assert!(version_rank(version) >= version_rank(MIN_PROTOCOL_VERSION));
}

#[tokio::test]
async fn test_tls_welcome_reports_cipher() {
    let host = TestHost::start().await;
    let mut client = host.tls_client().await;
    let allowed = allowed_cipher_names();

    let tls = client.tls_info().cloned().unwrap();
    assert_acceptable_version(&tls.protocol_version);
    assert!(allowed.contains(&tls.cipher), "{} not allowed", tls.cipher);

    let welcome = client.welcome().clone();
    assert!(welcome.is_welcome());
    assert!(welcome.cifrado);
    match &welcome.payload {
        Payload::Welcome {
            mensaje,
            conexion_segura,
            cipher,
            ..
        } => {
            assert!(mensaje.ends_with("TLS"));
            assert!(conexion_segura);
            assert_eq!(cipher.as_deref(), Some(tls.cipher.as_str()));
        }
        other => panic!("unexpected welcome payload: {other:?}"),
    }

    let pong = client.send("ping").await.unwrap();
    assert_ok_text(&pong, "pong");
    assert!(pong.cifrado);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_simultaneous_tls_clients_share_one_certificate() {
    let host = TestHost::start_with(|config| config.plain.enabled = false).await;
    let cert_dir = host.dir().join("certs");
    let before = std::fs::read(host.ca_cert()).unwrap();

    let addr = host.tls_addr();
    let ca = host.ca_cert();
    let (a, b) = tokio::join!(
        CommandClient::connect_tls(addr, "localhost", &ca),
        CommandClient::connect_tls(addr, "localhost", &ca),
    );
    let (mut a, mut b) = (a.unwrap(), b.unwrap());
    assert_ok_text(&a.send("ping").await.unwrap(), "pong");
    assert_ok_text(&b.send("ping").await.unwrap(), "pong");

    let mut names: Vec<_> = std::fs::read_dir(&cert_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["server.crt", "server.key"]);
    assert_eq!(std::fs::read(host.ca_cert()).unwrap(), before);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_is_error_on_tls() {
    let host = TestHost::start().await;
    let mut client = host.tls_client().await;

    let response = client.send("bailar").await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(response.cifrado);
    assert!(response.message().unwrap().contains("'bailar'"));
    assert_eq!(host.metrics().errors(TransportKind::TlsTcp, "unknown_command"), 1);
    assert_eq!(host.metrics().errors(TransportKind::PlainTcp, "unknown_command"), 0);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_status_follows_configuration() {
    let host = TestHost::start_with(|config| {
        config.tls.unknown_command_status = nethub::UnknownCommandStatus::Ok;
    })
    .await;
    let mut client = host.tls_client().await;

    let response = client.send("bailar").await.unwrap();
    assert_eq!(response.status, Status::Ok);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_info_over_tls() {
    let host = TestHost::start().await;
    let mut client = host.tls_client().await;
    let negotiated = client.tls_info().cloned().unwrap();

    match client.send("info").await.unwrap().payload {
        Payload::Info {
            servidor,
            transporte,
            protocolo,
            cipher,
            certificado,
            ..
        } => {
            assert_eq!(servidor, "NetHub TLS Server v2.0");
            assert_eq!(transporte, "tcp_tls");
            assert_eq!(protocolo, Some(negotiated.protocol_version.clone()));
            assert_eq!(cipher, Some(negotiated.cipher.clone()));
            assert_eq!(certificado.as_deref(), Some("Autofirmado"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_tls_record_keeps_negotiated_parameters() {
    let host = TestHost::start().await;
    let mut client = host.tls_client().await;
    let negotiated = client.tls_info().cloned().unwrap();

    let ack = client.send("bye").await.unwrap();
    assert_eq!(ack.status, Status::Close);

    let closed = wait_for_closed(host.registry(), 1).await;
    let record = &closed[0];
    assert_eq!(record.transport, TransportKind::TlsTcp);
    assert_eq!(record.close_reason, Some(CloseReason::ClientCommand));
    assert_eq!(record.negotiated_cipher, Some(negotiated.cipher));
    assert_eq!(
        record.negotiated_protocol_version,
        Some(negotiated.protocol_version)
    );

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_plaintext_on_tls_port_never_reaches_a_session() {
    let host = TestHost::start().await;

    let mut raw = TcpStream::connect(host.tls_addr()).await.unwrap();
    raw.write_all(b"ping\n").await.unwrap();
    let mut buf = [0u8; 256];
    let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
        .await
        .expect("server kept a failed handshake open");
    // an alert or a plain close, never a JSON line
    if let Ok(n) = read {
        assert!(!buf[..n].contains(&b'{'));
    }

    wait_for(|| {
        (host.metrics().errors(TransportKind::TlsTcp, "tls_handshake") == 1).then_some(())
    })
    .await;
    assert!(host.registry().snapshot().is_empty());

    // the listener is still healthy
    let mut client = host.tls_client().await;
    assert_ok_text(&client.send("ping").await.unwrap(), "pong");

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected_by_client() {
    let host = TestHost::start().await;
    let other = tempfile::tempdir().unwrap();
    let foreign = ensure_certificate(other.path()).unwrap();

    let result = CommandClient::connect_tls(host.tls_addr(), "localhost", &foreign.cert).await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));

    host.shutdown().await.unwrap();
}
