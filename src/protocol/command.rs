//! Command parsing
//!
//! Turns one request line into a closed [`Command`] value. Matching trims the
//! line and folds it to lowercase; only the `ia` question keeps the client's
//! original casing.

use serde::{Deserialize, Serialize};

/// Every command the dispatcher understands, plus the fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `hora` / `time`
    Time,
    /// `fecha` / `date`
    Date,
    Ping,
    Info,
    Stats,
    Help,
    /// `ia <question>`; the question may be empty
    Ia { question: String },
    /// One of the configured close keywords
    Close,
    /// Anything else; carries the trimmed input as typed
    Unknown { raw: String },
}

/// A command together with the name echoed back in the `command` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub command: Command,
}

/// Recognized commands and their help line, in display order
pub const KNOWN_COMMANDS: &[(&str, &str)] = &[
    ("hora", "Obtener hora actual"),
    ("fecha", "Obtener fecha actual"),
    ("ping", "Test de conectividad"),
    ("info", "Información del servidor"),
    ("stats", "Estadísticas de conexión"),
    ("help", "Esta ayuda"),
    ("ia <pregunta>", "Consultar IA"),
];

/// Case-insensitive set of keywords that end a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCommands(Vec<String>);

impl Default for CloseCommands {
    fn default() -> Self {
        Self::new(["exit", "adios", "bye", "quit"])
    }
}

impl CloseCommands {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut folded: Vec<String> = Vec::new();
        for word in words {
            let word = word.as_ref().trim().to_lowercase();
            if !word.is_empty() && !folded.contains(&word) {
                folded.push(word);
            }
        }
        Self(folded)
    }

    pub fn matches(&self, folded: &str) -> bool {
        self.0.iter().any(|w| w == folded)
    }

    pub fn words(&self) -> &[String] {
        &self.0
    }
}

impl Command {
    /// Parse one request line
    pub fn parse(line: &str, close: &CloseCommands) -> ParsedCommand {
        let trimmed = line.trim();
        let folded = trimmed.to_lowercase();

        if close.matches(&folded) {
            return ParsedCommand {
                name: folded,
                command: Command::Close,
            };
        }

        let command = match folded.as_str() {
            "hora" | "time" => Command::Time,
            "fecha" | "date" => Command::Date,
            "ping" => Command::Ping,
            "info" => Command::Info,
            "stats" => Command::Stats,
            "help" => Command::Help,
            "ia" => Command::Ia {
                question: String::new(),
            },
            _ => match trimmed.split_once(char::is_whitespace) {
                Some((head, rest)) if head.eq_ignore_ascii_case("ia") => {
                    return ParsedCommand {
                        name: "ia".to_string(),
                        command: Command::Ia {
                            question: rest.trim().to_string(),
                        },
                    };
                }
                _ => Command::Unknown {
                    raw: trimmed.to_string(),
                },
            },
        };

        ParsedCommand {
            name: folded,
            command,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Command::Close)
    }
}

/// `hora | fecha | ping | ... | exit` as shown in the unknown-command reply
pub fn command_summary(close: &CloseCommands) -> String {
    KNOWN_COMMANDS
        .iter()
        .map(|(name, _)| name.split_whitespace().next().unwrap_or(*name))
        .chain(close.words().iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Help lines, `name - description`
pub fn help_lines(close: &CloseCommands) -> Vec<String> {
    let mut lines: Vec<String> = KNOWN_COMMANDS
        .iter()
        .map(|(name, desc)| format!("{} - {}", name, desc))
        .collect();
    if !close.words().is_empty() {
        lines.push(format!("{} - Cerrar conexión", close.words().join(" / ")));
    }
    lines
}
