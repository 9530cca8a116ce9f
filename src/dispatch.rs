//! Command dispatcher
//!
//! Maps one request line plus a read-only [`ConnectionContext`] to exactly one
//! [`CommandResponse`]. Dispatch never fails: unknown input, a missing `ia`
//! question or a broken AI backend all come back as response values.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::ai::{AiBackend, AiError};
use crate::collab::metrics::error_type;
use crate::collab::Metrics;
use crate::protocol::command::{command_summary, help_lines};
use crate::protocol::{CloseCommands, Command, CommandResponse, FrameError, Payload, Status};
use crate::registry::{ConnectionId, TlsInfo, TransportKind};

/// Version string announced in `welcome` and `info`
pub const PROTOCOL_VERSION: &str = "2.0";

/// Text sent back when the client asks to close
pub const CLOSE_ACK: &str = "Hasta luego. Cerrando conexión...";

/// Default bound on one `ia` call
pub const DEFAULT_IA_TIMEOUT: Duration = Duration::from_secs(60);

/// Status used for unrecognized commands on a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCommandStatus {
    Ok,
    Error,
}

impl UnknownCommandStatus {
    /// Per-transport default: plaintext answers `ok`, TLS answers `error`
    pub fn default_for(transport: TransportKind) -> Self {
        match transport {
            TransportKind::PlainTcp => UnknownCommandStatus::Ok,
            TransportKind::TlsTcp => UnknownCommandStatus::Error,
        }
    }
}

/// Read-only view of the connection a command arrived on
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub tls: Option<TlsInfo>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Active connections across all transports
    pub active_connections: usize,
}

impl ConnectionContext {
    fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }
}

/// Stateless command handler shared by every session of one listener
pub struct Dispatcher {
    close: CloseCommands,
    unknown_status: UnknownCommandStatus,
    ai: Arc<dyn AiBackend>,
    ai_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(ai: Arc<dyn AiBackend>, metrics: Arc<Metrics>) -> Self {
        Self {
            close: CloseCommands::default(),
            unknown_status: UnknownCommandStatus::Ok,
            ai,
            ai_timeout: DEFAULT_IA_TIMEOUT,
            metrics,
        }
    }

    pub fn with_close_commands(mut self, close: CloseCommands) -> Self {
        self.close = close;
        self
    }

    pub fn with_unknown_status(mut self, status: UnknownCommandStatus) -> Self {
        self.unknown_status = status;
        self
    }

    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = timeout;
        self
    }

    pub fn close_commands(&self) -> &CloseCommands {
        &self.close
    }

    /// Unsolicited first message of every session
    pub fn welcome(&self, ctx: &ConnectionContext) -> CommandResponse {
        let (mensaje, cipher) = match &ctx.tls {
            Some(tls) => (
                "Bienvenido al servidor NetHub TLS",
                Some(tls.cipher.clone()),
            ),
            None => ("Bienvenido al servidor NetHub", None),
        };
        CommandResponse::ok(
            "welcome",
            Payload::Welcome {
                tipo: "welcome".to_string(),
                mensaje: mensaje.to_string(),
                version: PROTOCOL_VERSION.to_string(),
                conexion_segura: ctx.is_tls(),
                cipher,
                instrucciones: "Escribe 'help' para ver comandos disponibles".to_string(),
            },
        )
        .encrypted(ctx.is_tls())
    }

    /// Answer one request line
    pub async fn dispatch(&self, line: &str, ctx: &ConnectionContext) -> CommandResponse {
        let parsed = Command::parse(line, &self.close);
        let name = parsed.name;

        let response = match parsed.command {
            Command::Time => CommandResponse::text(
                Status::Ok,
                name,
                Local::now().format("%H:%M:%S").to_string(),
            ),
            Command::Date => CommandResponse::text(
                Status::Ok,
                name,
                Local::now().format("%d/%m/%Y").to_string(),
            ),
            Command::Ping => CommandResponse::text(Status::Ok, name, "pong"),
            Command::Info => CommandResponse::ok(name, self.info(ctx)),
            Command::Stats => CommandResponse::ok(
                name,
                Payload::Stats {
                    id_conexion: ctx.id.as_u64(),
                    conexion_segura: ctx.is_tls(),
                    ip_cliente: ctx.peer.ip().to_string(),
                    puerto_cliente: ctx.peer.port(),
                    bytes_enviados: ctx.bytes_sent,
                    bytes_recibidos: ctx.bytes_received,
                    conexiones_activas: ctx.active_connections,
                },
            ),
            Command::Help => CommandResponse::ok(
                name,
                Payload::Help {
                    comandos_disponibles: help_lines(&self.close),
                },
            ),
            Command::Ia { question } => self.ask(name, question, ctx).await,
            Command::Close => CommandResponse::text(Status::Close, name, CLOSE_ACK),
            Command::Unknown { raw } => {
                self.metrics
                    .error(ctx.transport, error_type::UNKNOWN_COMMAND);
                let text = format!(
                    "Comando '{}' no reconocido. Comandos: {}",
                    raw,
                    command_summary(&self.close)
                );
                match self.unknown_status {
                    UnknownCommandStatus::Ok => CommandResponse::text(Status::Ok, name, text),
                    UnknownCommandStatus::Error => CommandResponse::error(name, text),
                }
            }
        };

        response.encrypted(ctx.is_tls())
    }

    /// ERROR response for a line the codec rejected
    pub fn protocol_error(&self, err: &FrameError, ctx: &ConnectionContext) -> CommandResponse {
        let mensaje = match err {
            FrameError::LineTooLong { limit } => {
                format!("Línea demasiado larga (máximo {} bytes)", limit)
            }
            FrameError::InvalidUtf8 => "La línea recibida no es UTF-8 válido".to_string(),
            other => format!("Error de protocolo: {}", other),
        };
        CommandResponse::error("protocol_error", mensaje).encrypted(ctx.is_tls())
    }

    fn info(&self, ctx: &ConnectionContext) -> Payload {
        match &ctx.tls {
            Some(tls) => Payload::Info {
                servidor: "NetHub TLS Server v2.0".to_string(),
                version: PROTOCOL_VERSION.to_string(),
                transporte: ctx.transport.as_str().to_string(),
                protocolo: Some(tls.protocol_version.clone()),
                cipher: Some(tls.cipher.clone()),
                certificado: Some("Autofirmado".to_string()),
            },
            None => Payload::Info {
                servidor: "NetHub Server v2.0".to_string(),
                version: PROTOCOL_VERSION.to_string(),
                transporte: ctx.transport.as_str().to_string(),
                protocolo: None,
                cipher: None,
                certificado: None,
            },
        }
    }

    async fn ask(
        &self,
        name: String,
        question: String,
        ctx: &ConnectionContext,
    ) -> CommandResponse {
        if question.is_empty() {
            return CommandResponse::error(name, "Uso: ia <pregunta>");
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.ai_timeout, self.ai.ask(&question)).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout(self.ai_timeout)),
        };
        self.metrics
            .observe_ia(self.ai.model(), started.elapsed().as_secs_f64());

        match result {
            Ok(respuesta) => CommandResponse::ok(
                name,
                Payload::Ia {
                    pregunta: question,
                    respuesta,
                },
            ),
            Err(e) => {
                tracing::warn!("ia request from {} failed: {}", ctx.peer, e);
                self.metrics.error(ctx.transport, error_type::IA);
                CommandResponse::error(name, format!("Error en IA: {}", e))
            }
        }
    }
}
