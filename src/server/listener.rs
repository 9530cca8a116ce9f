//! Transport listener
//!
//! Binds one socket for one transport kind and spawns a session task per
//! accepted connection. The TLS handshake runs inside that task, bounded by
//! the handshake timeout, so a stalled client never holds up `accept`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::collab::metrics::error_type;
use crate::collab::EventLevel;
use crate::error::{NethubError, Result};
use crate::registry::TransportKind;
use crate::server::session::{run_session, Accepted, SessionShared};
use crate::tls::describe_session;

/// Default bound on the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time sessions get to finish after the listener stops
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after fd exhaustion before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Timing knobs of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTimeouts {
    pub handshake: Duration,
    pub drain: Duration,
}

impl Default for ListenerTimeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            drain: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// A bound, not yet accepting, listener
pub struct TransportListener {
    listener: TcpListener,
    transport: TransportKind,
    acceptor: Option<TlsAcceptor>,
    timeouts: ListenerTimeouts,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind `addr`; TLS listeners need a server config
    pub async fn bind(
        addr: SocketAddr,
        transport: TransportKind,
        tls: Option<Arc<ServerConfig>>,
        timeouts: ListenerTimeouts,
    ) -> Result<Self> {
        let acceptor = match (transport, tls) {
            (TransportKind::TlsTcp, Some(config)) => Some(TlsAcceptor::from(config)),
            (TransportKind::TlsTcp, None) => {
                return Err(NethubError::TlsConfig {
                    message: "TLS listener started without certificate material".to_string(),
                })
            }
            (TransportKind::PlainTcp, _) => None,
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NethubError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            transport,
            acceptor,
            timeouts,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Accept until `shutdown` flips to `true`, then drain sessions
    ///
    /// Returns an error only if the listening socket itself failed.
    pub async fn run(
        self,
        shared: Arc<SessionShared>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let Self {
            listener,
            transport,
            acceptor,
            timeouts,
            local_addr,
        } = self;
        let mut sessions: JoinSet<()> = JoinSet::new();

        tracing::info!("{} listener accepting on {}", transport, local_addr);

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender also means stop
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(
                            &mut sessions,
                            stream,
                            peer,
                            transport,
                            acceptor.clone(),
                            timeouts.handshake,
                            Arc::clone(&shared),
                        );
                    }
                    Err(e) if is_fatal_accept_error(&e) => {
                        tracing::error!("{} listener on {} failed: {}", transport, local_addr, e);
                        break Err(NethubError::ListenerLost {
                            addr: local_addr.to_string(),
                            source: e,
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed on {}: {}", local_addr, e);
                        shared.collab.metrics.error(transport, error_type::ACCEPT);
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Session task on {} panicked: {}", local_addr, e);
                        }
                    }
                }
            }
        };

        drop(listener);
        tracing::info!(
            "{} listener on {} closed, draining {} session(s)",
            transport,
            local_addr,
            sessions.len()
        );
        drain(&mut sessions, timeouts.drain).await;

        outcome
    }
}

fn spawn_connection(
    sessions: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    transport: TransportKind,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    shared: Arc<SessionShared>,
) {
    let id = shared.registry.allocate_id();
    tracing::debug!("Accepted {} from {} as {}", transport, peer, id);

    sessions.spawn(async move {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!("{}: set_nodelay: {}", id, e);
        }
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("{}: socket lost before registration: {}", id, e);
                return;
            }
        };

        match acceptor {
            None => {
                let accepted = Accepted {
                    id,
                    transport,
                    peer,
                    local,
                    tls: None,
                };
                run_session(stream, accepted, shared).await;
            }
            Some(acceptor) => {
                let handshake =
                    tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await;
                let tls_stream = match handshake {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        handshake_failed(&shared, transport, peer, &e.to_string());
                        return;
                    }
                    Err(_) => {
                        handshake_failed(
                            &shared,
                            transport,
                            peer,
                            &format!("timed out after {:?}", handshake_timeout),
                        );
                        return;
                    }
                };

                let info = describe_session(tls_stream.get_ref().1);
                tracing::debug!(
                    "{}: TLS established ({}, {})",
                    id,
                    info.protocol_version,
                    info.cipher
                );
                let accepted = Accepted {
                    id,
                    transport,
                    peer,
                    local,
                    tls: Some(info),
                };
                run_session(tls_stream, accepted, shared).await;
            }
        }
    });
}

fn handshake_failed(
    shared: &SessionShared,
    transport: TransportKind,
    peer: SocketAddr,
    reason: &str,
) {
    shared
        .collab
        .metrics
        .error(transport, error_type::TLS_HANDSHAKE);
    shared.collab.log_event(
        EventLevel::Error,
        transport.as_str(),
        &format!("Error en handshake TLS con {}: {}", peer, reason),
        Some(peer.ip()),
    );
}

/// Wait for sessions up to `deadline`, then cancel the rest
async fn drain(sessions: &mut JoinSet<()>, deadline: Duration) {
    if sessions.is_empty() {
        return;
    }
    let finished = tokio::time::timeout(deadline, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        tracing::warn!(
            "Drain deadline of {:?} passed, cancelling {} session(s)",
            deadline,
            sessions.len()
        );
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

/// Errors meaning the listening socket itself is unusable
fn is_fatal_accept_error(e: &io::Error) -> bool {
    const EBADF: i32 = 9;
    e.kind() == io::ErrorKind::InvalidInput || e.raw_os_error() == Some(EBADF)
}

/// Out of file descriptors (EMFILE / ENFILE) or memory
fn is_resource_exhaustion(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
        || e.kind() == io::ErrorKind::OutOfMemory
}
