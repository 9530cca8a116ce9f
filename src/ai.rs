//! AI backend used by the `ia` command
//!
//! The backend is the only slow, fallible collaborator a command can touch.
//! The dispatcher bounds it with a timeout and turns every failure into an
//! ERROR response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AiError {
    #[error("AI backend is not configured")]
    Unavailable,

    #[error("AI backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("AI backend request failed: {0}")]
    Http(String),

    #[error("AI backend returned HTTP {0}")]
    Status(u16),

    #[error("Unexpected AI backend response: {0}")]
    InvalidResponse(String),
}

/// Answers free-form questions
#[async_trait]
pub trait AiBackend: Send + Sync {
    /// Model label, used for metrics
    fn model(&self) -> &str;

    async fn ask(&self, question: &str) -> Result<String, AiError>;
}

/// Backend for hosts started without `ia`
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

#[async_trait]
impl AiBackend for DisabledBackend {
    fn model(&self) -> &str {
        "disabled"
    }

    async fn ask(&self, _question: &str) -> Result<String, AiError> {
        Err(AiError::Unavailable)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatReply>,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

/// Client for a local Ollama server (`POST {endpoint}/api/chat`)
pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl AiBackend for OllamaBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn ask(&self, question: &str) -> Result<String, AiError> {
        let url = format!("{}/api/chat", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: question,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout(self.timeout)
                } else {
                    AiError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AiError::Status(response.status().as_u16()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;

        parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| AiError::InvalidResponse("missing message.content".to_string()))
    }
}
