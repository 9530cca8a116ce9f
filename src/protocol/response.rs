//! Response message types
//!
//! Every server → client message is a [`CommandResponse`]: `status` and
//! `command` at the top level, then the fields of one [`Payload`] variant
//! flattened next to them.

use serde::{Deserialize, Serialize};

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    /// The server is about to close the connection
    Close,
}

/// One JSON object on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: Status,
    pub command: String,
    #[serde(flatten)]
    pub payload: Payload,
    /// Set on every message sent over the TLS transport
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cifrado: bool,
}

/// Command-specific fields
///
/// Untagged: the variant is recognized by its field names, so order matters
/// for deserialization (most specific first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Welcome {
        tipo: String,
        mensaje: String,
        version: String,
        conexion_segura: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cipher: Option<String>,
        instrucciones: String,
    },
    Info {
        servidor: String,
        version: String,
        transporte: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocolo: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cipher: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        certificado: Option<String>,
    },
    Stats {
        id_conexion: u64,
        conexion_segura: bool,
        ip_cliente: String,
        puerto_cliente: u16,
        bytes_enviados: u64,
        bytes_recibidos: u64,
        conexiones_activas: usize,
    },
    Help {
        comandos_disponibles: Vec<String>,
    },
    Ia {
        pregunta: String,
        respuesta: String,
    },
    Text {
        respuesta: String,
    },
    Error {
        mensaje: String,
    },
}

impl CommandResponse {
    pub fn ok(command: impl Into<String>, payload: Payload) -> Self {
        Self {
            status: Status::Ok,
            command: command.into(),
            payload,
            cifrado: false,
        }
    }

    pub fn text(status: Status, command: impl Into<String>, respuesta: impl Into<String>) -> Self {
        Self {
            status,
            command: command.into(),
            payload: Payload::Text {
                respuesta: respuesta.into(),
            },
            cifrado: false,
        }
    }

    pub fn error(command: impl Into<String>, mensaje: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            command: command.into(),
            payload: Payload::Error {
                mensaje: mensaje.into(),
            },
            cifrado: false,
        }
    }

    /// Mark the response as sent over TLS
    pub fn encrypted(mut self, cifrado: bool) -> Self {
        self.cifrado = cifrado;
        self
    }

    /// Human-readable text of the payload, if it has one
    pub fn message(&self) -> Option<&str> {
        match &self.payload {
            Payload::Welcome { mensaje, .. } | Payload::Error { mensaje } => Some(mensaje.as_str()),
            Payload::Ia { respuesta, .. } | Payload::Text { respuesta } => Some(respuesta.as_str()),
            _ => None,
        }
    }

    pub fn is_welcome(&self) -> bool {
        matches!(&self.payload, Payload::Welcome { tipo, .. } if tipo == "welcome")
    }
}
