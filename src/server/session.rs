//! Session handler
//!
//! Owns one accepted (and, for TLS, already handshaken) stream:
//!
//! ```text
//! REGISTERED → WELCOMED → COMMAND_LOOP ⟲ → CLOSING → CLOSED
//! ```
//!
//! The record is closed exactly once whatever the exit path. Normal exits
//! close it explicitly; if the task is aborted (drain deadline at shutdown)
//! the [`SessionGuard`] closes it on drop with reason `shutdown`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collab::metrics::error_type;
use crate::collab::{Collaborators, Direction, EventLevel};
use crate::dispatch::{ConnectionContext, Dispatcher};
use crate::protocol::{
    CommandResponse, FrameReader, FrameWriter, InboundLine, Status, DEFAULT_MAX_LINE_BYTES,
};
use crate::registry::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionRecord, ConnectionRegistry, TlsInfo,
    TransportKind,
};

/// Bound for timeout notices and the final shutdown write
const NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

const LIFETIME_NOTICE: &str = "Tiempo máximo de conexión alcanzado";

/// Per-session limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_line_bytes: usize,
    /// Close after this long without a complete request line
    pub idle_timeout: Option<Duration>,
    /// Close this long after registration regardless of activity
    pub max_lifetime: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            idle_timeout: None,
            max_lifetime: None,
        }
    }
}

/// State shared by every session of one listener
pub struct SessionShared {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub collab: Collaborators,
    pub settings: SessionSettings,
}

/// Identity of an accepted connection, known before registration
#[derive(Debug, Clone)]
pub struct Accepted {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub tls: Option<TlsInfo>,
}

enum ReadOutcome {
    Line(InboundLine),
    Eof,
    Failed(std::io::Error),
    Idle,
    Lifetime,
}

/// Closes the record on every exit path, including task abort
struct SessionGuard {
    handle: ConnectionHandle,
    shared: Arc<SessionShared>,
    /// Pending insert of the store row, taken once its close is issued
    store_row: Option<JoinHandle<Option<i64>>>,
}

impl SessionGuard {
    fn service(&self) -> &'static str {
        self.handle.transport().as_str()
    }

    fn log(&self, level: EventLevel, message: &str) {
        self.shared
            .collab
            .log_event(level, self.service(), message, Some(self.handle.peer().ip()));
    }

    /// Mark CLOSED and report; `None` if already closed
    fn finalize(&self, reason: CloseReason) -> Option<ConnectionRecord> {
        let record = self.handle.close(reason)?;
        self.shared
            .collab
            .metrics
            .connection_closed(record.transport);
        self.log(
            EventLevel::Info,
            &format!(
                "Conexión cerrada: {} ({} bytes ↓, {} bytes ↑) [{}]",
                record.peer(),
                record.bytes_received,
                record.bytes_sent,
                reason.as_str()
            ),
        );
        Some(record)
    }

    /// Insert the ACTIVE store row on its own task
    fn open_store_row(&mut self) {
        let Some(store) = self.shared.collab.store.clone() else {
            return;
        };
        let metrics = Arc::clone(&self.shared.collab.metrics);
        let record = self.handle.snapshot();
        self.store_row = Some(tokio::spawn(async move {
            match store.record_connection_opened(&record).await {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!("Failed to store connection {}: {}", record.id, e);
                    metrics.error(record.transport, error_type::STORE);
                    None
                }
            }
        }));
    }

    /// Mark the store row CLOSED on its own task
    ///
    /// The update outlives this session, so an abort while it is in flight
    /// still leaves the row closed. `None` if no row is pending.
    fn close_store_row(&mut self) -> Option<JoinHandle<()>> {
        let opening = self.store_row.take()?;
        let store = self.shared.collab.store.clone()?;
        let metrics = Arc::clone(&self.shared.collab.metrics);
        let record = self.handle.snapshot();
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(runtime.spawn(async move {
            let Ok(Some(row)) = opening.await else {
                return;
            };
            if let Err(e) = store
                .record_connection_closed(row, record.bytes_sent, record.bytes_received)
                .await
            {
                tracing::warn!("Failed to store close of {}: {}", record.id, e);
                metrics.error(record.transport, error_type::STORE);
            }
        }))
    }

    async fn close(mut self, reason: CloseReason) -> Option<ConnectionRecord> {
        let record = self.finalize(reason)?;
        if let Some(update) = self.close_store_row() {
            if let Err(e) = update.await {
                tracing::warn!("Store update for {} failed: {}", record.id, e);
            }
        }
        Some(record)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(record) = self.finalize(CloseReason::Shutdown) {
            tracing::debug!("{} cancelled before finishing", record.id);
        }
        let _ = self.close_store_row();
    }
}

/// Run one session to completion and return its final record
///
/// Returns `None` only if the record was somehow closed by someone else.
pub async fn run_session<S>(
    stream: S,
    accepted: Accepted,
    shared: Arc<SessionShared>,
) -> Option<ConnectionRecord>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let handle = shared.registry.register(
        accepted.id,
        accepted.transport,
        accepted.peer,
        accepted.local,
        accepted.tls.clone(),
    );
    shared.collab.metrics.connection_opened(accepted.transport);

    let mut guard = SessionGuard {
        handle,
        shared: Arc::clone(&shared),
        store_row: None,
    };
    let deadline = shared.settings.max_lifetime.map(|d| Instant::now() + d);

    let greeting = match &accepted.tls {
        Some(tls) => format!(
            "Conexión segura establecida desde {} ({}, {})",
            accepted.peer, tls.protocol_version, tls.cipher
        ),
        None => format!("Conexión establecida desde {}", accepted.peer),
    };
    guard.log(EventLevel::Info, &greeting);
    guard.open_store_row();

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, shared.settings.max_line_bytes);
    let mut writer = FrameWriter::new(write_half);

    let welcome = shared.dispatcher.welcome(&context(&guard.handle, &shared));
    match within(deadline, send(&guard, &mut writer, &welcome)).await {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            tracing::debug!("{}: welcome failed: {}", accepted.id, e);
            return guard.close(CloseReason::IoError).await;
        }
        None => {
            guard.log(EventLevel::Info, LIFETIME_NOTICE);
            return guard.close(CloseReason::LifetimeExceeded).await;
        }
    }

    let reason = loop {
        let inbound = match read_next(&mut reader, shared.settings.idle_timeout, deadline).await {
            ReadOutcome::Line(inbound) => inbound,
            ReadOutcome::Eof => break CloseReason::PeerClosed,
            ReadOutcome::Failed(e) => {
                guard.log(EventLevel::Error, &format!("Error de lectura: {}", e));
                shared
                    .collab
                    .metrics
                    .error(accepted.transport, error_type::IO);
                break CloseReason::IoError;
            }
            ReadOutcome::Idle => {
                notify_timeout(&guard, &mut writer, "Conexión cerrada por inactividad").await;
                break CloseReason::IdleTimeout;
            }
            ReadOutcome::Lifetime => {
                notify_timeout(&guard, &mut writer, LIFETIME_NOTICE).await;
                break CloseReason::LifetimeExceeded;
            }
        };

        guard.handle.add_received(inbound.bytes);
        shared
            .collab
            .metrics
            .bytes(accepted.transport, Direction::Received, inbound.bytes);
        shared.collab.metrics.message_received(accepted.transport);

        let ctx = context(&guard.handle, &shared);
        let response = match inbound.line {
            Ok(line) => {
                tracing::debug!("{} ← {}", accepted.id, line);
                match within(deadline, shared.dispatcher.dispatch(&line, &ctx)).await {
                    Some(response) => response,
                    None => {
                        guard.log(EventLevel::Info, LIFETIME_NOTICE);
                        break CloseReason::LifetimeExceeded;
                    }
                }
            }
            Err(e) => {
                guard.log(EventLevel::Warning, &format!("Error de protocolo: {}", e));
                shared
                    .collab
                    .metrics
                    .error(accepted.transport, error_type::PROTOCOL);
                shared.dispatcher.protocol_error(&e, &ctx)
            }
        };

        let closing = response.status == Status::Close;
        match within(deadline, send(&guard, &mut writer, &response)).await {
            Some(Ok(())) if closing => break CloseReason::ClientCommand,
            Some(Ok(())) => {}
            // Acknowledgment is best-effort
            Some(Err(_)) if closing => break CloseReason::ClientCommand,
            Some(Err(e)) => {
                guard.log(EventLevel::Error, &format!("Error de escritura: {}", e));
                shared
                    .collab
                    .metrics
                    .error(accepted.transport, error_type::IO);
                break CloseReason::IoError;
            }
            // Peer stopped reading
            None => {
                guard.log(EventLevel::Info, LIFETIME_NOTICE);
                break CloseReason::LifetimeExceeded;
            }
        }
    };

    match tokio::time::timeout(NOTICE_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!("{}: shutdown: {}", accepted.id, e),
        Err(_) => tracing::trace!("{}: shutdown timed out", accepted.id),
    }
    drop(reader);
    drop(writer);

    guard.close(reason).await
}

fn context(handle: &ConnectionHandle, shared: &SessionShared) -> ConnectionContext {
    ConnectionContext {
        id: handle.id(),
        transport: handle.transport(),
        peer: handle.peer(),
        tls: handle.tls().cloned(),
        bytes_sent: handle.bytes_sent(),
        bytes_received: handle.bytes_received(),
        active_connections: shared.registry.active_count(None),
    }
}

async fn read_next<R>(
    reader: &mut FrameReader<R>,
    idle: Option<Duration>,
    deadline: Option<Instant>,
) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let idle_at = idle.map(|d| Instant::now() + d);
    let wake = match (idle_at, deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let result = match wake {
        Some(at) => match tokio::time::timeout_at(at, reader.next_line()).await {
            Ok(result) => result,
            Err(_) => {
                return match deadline {
                    Some(d) if d <= Instant::now() => ReadOutcome::Lifetime,
                    _ => ReadOutcome::Idle,
                };
            }
        },
        None => reader.next_line().await,
    };

    match result {
        Ok(Some(inbound)) => ReadOutcome::Line(inbound),
        Ok(None) => ReadOutcome::Eof,
        Err(e) => ReadOutcome::Failed(e),
    }
}

async fn send<W>(
    guard: &SessionGuard,
    writer: &mut FrameWriter<W>,
    response: &CommandResponse,
) -> Result<(), crate::protocol::FrameError>
where
    W: AsyncWrite + Unpin,
{
    let written = writer.send(response).await?;
    let transport = guard.handle.transport();
    guard.handle.add_sent(written);
    guard
        .shared
        .collab
        .metrics
        .bytes(transport, Direction::Sent, written);
    guard.shared.collab.metrics.message_sent(transport);
    Ok(())
}

async fn notify_timeout<W>(guard: &SessionGuard, writer: &mut FrameWriter<W>, text: &str)
where
    W: AsyncWrite + Unpin,
{
    guard.log(EventLevel::Info, text);
    let notice = CommandResponse::text(Status::Close, "timeout", text)
        .encrypted(guard.handle.transport().is_tls());
    let _ = tokio::time::timeout(NOTICE_TIMEOUT, send(guard, writer, &notice)).await;
}

/// Run `fut` until the lifetime deadline; `None` once it has passed
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}
