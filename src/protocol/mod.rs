//! NetHub wire protocol
//!
//! Clients send newline-terminated UTF-8 text, one command per line. The
//! server answers every line with exactly one JSON object, also newline
//! terminated, and opens every session with an unsolicited welcome object.
//!
//! ```text
//! S: {"status":"ok","command":"welcome","tipo":"welcome","mensaje":"Bienvenido al servidor NetHub",...}
//! C: ping
//! S: {"status":"ok","command":"ping","respuesta":"pong"}
//! C: ia ¿qué es TLS?
//! S: {"status":"ok","command":"ia","pregunta":"¿qué es TLS?","respuesta":"..."}
//! C: exit
//! S: {"status":"close","command":"exit","respuesta":"Hasta luego. Cerrando conexión..."}
//! ```

pub mod codec;
pub mod command;
pub mod response;

pub use codec::{FrameError, FrameReader, FrameWriter, InboundLine, DEFAULT_MAX_LINE_BYTES};
pub use command::{CloseCommands, Command, ParsedCommand};
pub use response::{CommandResponse, Payload, Status};
