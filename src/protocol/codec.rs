//! Newline framing over any async byte stream
//!
//! [`FrameReader`] yields one request line at a time and reports exactly how
//! many bytes it pulled off the stream, so sessions can keep byte counters
//! honest. [`FrameWriter`] writes one JSON object followed by `\n`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Default upper bound for one request line, newline included
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Framing failures
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One line pulled off the stream
#[derive(Debug)]
pub struct InboundLine {
    /// Bytes consumed from the stream, terminator included
    pub bytes: usize,
    /// Decoded text without the line terminator, or why it was rejected
    pub line: Result<String, FrameError>,
}

/// Reads newline-delimited frames
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_line: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_line,
            buf: Vec::new(),
        }
    }

    /// Read the next line
    ///
    /// Returns `Ok(None)` on a clean end of stream. An unterminated trailing
    /// line is returned as a line; the following call then reports EOF.
    /// Oversized lines are drained up to their newline and reported as
    /// [`FrameError::LineTooLong`] inside [`InboundLine::line`].
    pub async fn next_line(&mut self) -> std::io::Result<Option<InboundLine>> {
        self.buf.clear();
        let mut consumed = 0usize;
        let mut overflow = false;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if consumed == 0 {
                    return Ok(None);
                }
                break;
            }

            let (take, terminated) = match available.iter().position(|&b| b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };

            if !overflow {
                if self.buf.len() + take > self.max_line {
                    overflow = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(&available[..take]);
                }
            }

            self.inner.consume(take);
            consumed += take;

            if terminated {
                break;
            }
        }

        let line = if overflow {
            Err(FrameError::LineTooLong {
                limit: self.max_line,
            })
        } else {
            decode_line(&self.buf)
        };

        Ok(Some(InboundLine {
            bytes: consumed,
            line,
        }))
    }

    /// Read the next line and parse it as JSON
    ///
    /// Used on the client side, where every line is a server response.
    pub async fn next_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.next_line().await? {
            None => Ok(None),
            Some(inbound) => {
                let line = inbound.line?;
                Ok(Some(serde_json::from_str(&line)?))
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> Result<String, FrameError> {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidUtf8)
}

/// Writes newline-terminated frames
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize `message` as one JSON line and flush it
    ///
    /// Returns the number of bytes written, newline included.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<usize, FrameError> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(bytes.len())
    }

    /// Send a raw text line (client side)
    pub async fn send_line(&mut self, line: &str) -> Result<usize, FrameError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(bytes.len())
    }

    /// Flush and shut down the write half
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}
