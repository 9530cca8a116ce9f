//! Plain TCP transport

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};

use nethub::dispatch::CLOSE_ACK;
use nethub::{AiBackend, AiError, CloseReason, Payload, Status, TransportKind};

use crate::common::{assert_ok_text, wait_for, wait_for_closed, wire_len, TestHost};

#[tokio::test]
async fn test_welcome_then_ping() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let welcome = client.welcome().clone();
    assert!(welcome.is_welcome());
    assert!(!welcome.cifrado);
    match &welcome.payload {
        Payload::Welcome {
            conexion_segura,
            cipher,
            version,
            ..
        } => {
            assert!(!conexion_segura);
            assert!(cipher.is_none());
            assert_eq!(version, "2.0");
        }
        other => panic!("unexpected welcome payload: {other:?}"),
    }

    let pong = client.send("ping").await.unwrap();
    assert_eq!(pong.command, "ping");
    assert_ok_text(&pong, "pong");

    client.send("exit").await.unwrap();
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hora_matches_server_clock() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let response = client.send("hora").await.unwrap();
    assert_eq!(response.status, Status::Ok);
    let text = response.message().unwrap();
    let reported = NaiveTime::parse_from_str(text, "%H:%M:%S").unwrap();

    let now = Local::now().time();
    let diff = (now.num_seconds_from_midnight() as i64
        - reported.num_seconds_from_midnight() as i64)
        .rem_euclid(86_400);
    assert!(diff <= 2 || diff >= 86_398, "clock drift of {diff}s");

    let fecha = client.send("FECHA").await.unwrap();
    assert_eq!(fecha.status, Status::Ok);
    assert_eq!(fecha.message().unwrap().len(), "dd/mm/yyyy".len());

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_command_acks_then_closes() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let ack = client.send("  Adios ").await.unwrap();
    assert_eq!(ack.status, Status::Close);
    assert_eq!(ack.message(), Some(CLOSE_ACK));
    assert!(client.at_eof().await.unwrap());

    let closed = wait_for_closed(host.registry(), 1).await;
    assert_eq!(closed[0].close_reason, Some(CloseReason::ClientCommand));
    assert!(closed[0].ended_at.is_some());
    wait_for(|| (host.registry().active_count(None) == 0).then_some(())).await;

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_disconnect_is_recorded() {
    let host = TestHost::start_plain().await;
    let client = host.plain_client().await;
    client.close().await.unwrap();

    let closed = wait_for_closed(host.registry(), 1).await;
    assert_eq!(closed[0].close_reason, Some(CloseReason::PeerClosed));
    wait_for(|| (host.metrics().active(TransportKind::PlainTcp) == 0).then_some(())).await;

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_is_ok_on_plain() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let response = client.send("bailar").await.unwrap();
    assert_eq!(response.status, Status::Ok);
    let text = response.message().unwrap();
    assert!(text.contains("'bailar'"), "{text}");
    assert!(text.contains("ping"), "{text}");
    assert_eq!(host.metrics().errors(TransportKind::PlainTcp, "unknown_command"), 1);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_clients_are_isolated() {
    let host = TestHost::start_plain().await;
    let mut a = host.plain_client().await;
    let mut b = host.plain_client().await;

    let (stats_a, stats_b) = tokio::join!(a.send("stats"), b.send("stats"));
    let (id_a, port_a, active_a) = match stats_a.unwrap().payload {
        Payload::Stats {
            id_conexion,
            puerto_cliente,
            conexiones_activas,
            ..
        } => (id_conexion, puerto_cliente, conexiones_activas),
        other => panic!("unexpected payload: {other:?}"),
    };
    let (id_b, port_b) = match stats_b.unwrap().payload {
        Payload::Stats {
            id_conexion,
            puerto_cliente,
            ..
        } => (id_conexion, puerto_cliente),
        other => panic!("unexpected payload: {other:?}"),
    };
    assert_ne!(id_a, id_b);
    assert_ne!(port_a, port_b);
    assert_eq!(active_a, 2);

    // a closing does not disturb b
    a.send("exit").await.unwrap();
    assert_ok_text(&b.send("ping").await.unwrap(), "pong");

    let closed = wait_for_closed(host.registry(), 1).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].peer_port, port_a);
    wait_for(|| {
        (host.registry().active_count(Some(TransportKind::PlainTcp)) == 1).then_some(())
    })
    .await;

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_byte_counters_match_wire() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let mut sent_by_server = wire_len(client.welcome());
    let mut received_by_server = 0u64;
    for command in ["ping", "hora", "info", "nada", "quit"] {
        let response = client.send(command).await.unwrap();
        received_by_server += command.len() as u64 + 1;
        sent_by_server += wire_len(&response);
    }

    let closed = wait_for_closed(host.registry(), 1).await;
    assert_eq!(closed[0].bytes_received, received_by_server);
    assert_eq!(closed[0].bytes_sent, sent_by_server);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stats_reports_running_counters() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let welcome_len = wire_len(client.welcome());
    let pong = client.send("ping").await.unwrap();
    let stats = client.send("stats").await.unwrap();
    match stats.payload {
        Payload::Stats {
            bytes_enviados,
            bytes_recibidos,
            conexion_segura,
            ip_cliente,
            ..
        } => {
            assert_eq!(bytes_enviados, welcome_len + wire_len(&pong));
            assert_eq!(bytes_recibidos, "ping\nstats\n".len() as u64);
            assert!(!conexion_segura);
            assert_eq!(ip_cliente, "127.0.0.1");
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_line_reports_protocol_error() {
    let host = TestHost::start_with(|config| {
        config.tls.enabled = false;
        config.session.max_line_bytes = 64;
    })
    .await;
    let mut client = host.plain_client().await;

    let long = "x".repeat(200);
    let response = client.send(&long).await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.command, "protocol_error");

    // the session survives
    assert_ok_text(&client.send("ping").await.unwrap(), "pong");
    assert_eq!(host.metrics().errors(TransportKind::PlainTcp, "protocol"), 1);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_info_and_help() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    match client.send("info").await.unwrap().payload {
        Payload::Info {
            servidor,
            transporte,
            protocolo,
            ..
        } => {
            assert_eq!(servidor, "NetHub Server v2.0");
            assert_eq!(transporte, "tcp");
            assert!(protocolo.is_none());
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    match client.send("help").await.unwrap().payload {
        Payload::Help {
            comandos_disponibles,
        } => {
            assert!(comandos_disponibles.iter().any(|l| l.starts_with("hora")));
            assert!(comandos_disponibles.iter().any(|l| l.contains("exit")));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ia_without_backend_is_an_error_response() {
    let host = TestHost::start_plain().await;
    let mut client = host.plain_client().await;

    let response = client.send("ia hola").await.unwrap();
    assert_eq!(response.status, Status::Error);
    assert!(response.message().unwrap().starts_with("Error en IA"));

    let usage = client.send("ia").await.unwrap();
    assert_eq!(usage.status, Status::Error);

    // still usable afterwards
    assert_ok_text(&client.send("ping").await.unwrap(), "pong");
    host.shutdown().await.unwrap();
}

struct UpperBackend;

#[async_trait]
impl AiBackend for UpperBackend {
    fn model(&self) -> &str {
        "upper"
    }

    async fn ask(&self, question: &str) -> Result<String, AiError> {
        Ok(question.to_uppercase())
    }
}

#[tokio::test]
async fn test_ia_with_backend_answers() {
    let host = TestHost::start_with_ai(Arc::new(UpperBackend)).await;
    let mut client = host.plain_client().await;

    let response = client.send("ia ¿Qué Tal?").await.unwrap();
    assert_eq!(response.status, Status::Ok);
    match response.payload {
        Payload::Ia {
            pregunta,
            respuesta,
        } => {
            assert_eq!(pregunta, "¿Qué Tal?");
            assert_eq!(respuesta, "¿QUÉ TAL?");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    assert!(host.metrics().render().contains("nethub_ia_response_seconds"));

    host.shutdown().await.unwrap();
}
