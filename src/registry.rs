//! Connection registry
//!
//! Shared table of every connection accepted by this process. Sessions hold a
//! [`ConnectionHandle`] for the record they own; everyone else (stats command,
//! logging, metrics, tests) only ever sees [`ConnectionRecord`] snapshots.
//!
//! # Thread Safety
//!
//! - `RwLock` over the id → entry map: registration and eviction take the
//!   write lock, snapshots take the read lock
//! - Byte counters are atomics on the entry, so a session never takes the map
//!   lock on its hot path
//! - The ACTIVE → CLOSED transition happens under the entry's own `Mutex`,
//!   which is what makes it happen exactly once
//!
//! Snapshots are eventually consistent with concurrent writers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Default number of closed records kept for historical stats
pub const DEFAULT_MAX_CLOSED_RECORDS: usize = 1024;

/// Opaque connection identifier, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    PlainTcp,
    TlsTcp,
}

impl TransportKind {
    /// Label used for metrics, log service names and storage rows
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::PlainTcp => "tcp",
            TransportKind::TlsTcp => "tcp_tls",
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, TransportKind::TlsTcp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent one of the close commands
    ClientCommand,
    /// Peer closed its write half (zero-byte read)
    PeerClosed,
    /// Unrecoverable read/write or TLS error
    IoError,
    IdleTimeout,
    LifetimeExceeded,
    /// Host shut down before the session finished on its own
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientCommand => "client_command",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::IoError => "io_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::LifetimeExceeded => "lifetime_exceeded",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Negotiated TLS parameters, captured right after the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    pub cipher: String,
    pub protocol_version: String,
}

/// Point-in-time copy of a connection's record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub peer_address: IpAddr,
    pub peer_port: u16,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub started_at: DateTime<Local>,
    pub ended_at: Option<DateTime<Local>>,
    pub close_reason: Option<CloseReason>,
    pub negotiated_cipher: Option<String>,
    pub negotiated_protocol_version: Option<String>,
}

impl ConnectionRecord {
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(self.peer_address, self.peer_port)
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}

/// Aggregate counters across the whole registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_plain: usize,
    pub active_tls: usize,
    pub total_opened: u64,
    pub closed_retained: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy)]
struct Closure {
    ended_at: DateTime<Local>,
    reason: CloseReason,
}

struct ConnectionEntry {
    id: ConnectionId,
    transport: TransportKind,
    peer: SocketAddr,
    local: SocketAddr,
    started_at: DateTime<Local>,
    tls: Option<TlsInfo>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closure: Mutex<Option<Closure>>,
}

impl ConnectionEntry {
    fn snapshot(&self) -> ConnectionRecord {
        let closure = *self.closure.lock();
        ConnectionRecord {
            id: self.id,
            transport: self.transport,
            peer_address: self.peer.ip(),
            peer_port: self.peer.port(),
            local_address: self.local.ip(),
            local_port: self.local.port(),
            state: if closure.is_some() {
                ConnectionState::Closed
            } else {
                ConnectionState::Active
            },
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            started_at: self.started_at,
            ended_at: closure.map(|c| c.ended_at),
            close_reason: closure.map(|c| c.reason),
            negotiated_cipher: self.tls.as_ref().map(|t| t.cipher.clone()),
            negotiated_protocol_version: self.tls.as_ref().map(|t| t.protocol_version.clone()),
        }
    }
}

/// Shared table of active and recently closed connections
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
    /// Closed ids, oldest first, for bounded retention
    closed_order: Mutex<VecDeque<ConnectionId>>,
    next_id: AtomicU64,
    active_plain: AtomicUsize,
    active_tls: AtomicUsize,
    total_opened: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    max_closed: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLOSED_RECORDS)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry that retains at most `max_closed` closed records
    pub fn new(max_closed: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            closed_order: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            active_plain: AtomicUsize::new(0),
            active_tls: AtomicUsize::new(0),
            total_opened: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            max_closed,
        }
    }

    /// Reserve an id for a freshly accepted socket
    ///
    /// Ids of connections that fail the TLS handshake are simply never
    /// registered.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert an ACTIVE record and hand ownership of it to the caller
    pub fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        transport: TransportKind,
        peer: SocketAddr,
        local: SocketAddr,
        tls: Option<TlsInfo>,
    ) -> ConnectionHandle {
        let entry = Arc::new(ConnectionEntry {
            id,
            transport,
            peer,
            local,
            started_at: Local::now(),
            tls,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closure: Mutex::new(None),
        });

        self.entries.write().insert(id, Arc::clone(&entry));
        self.active_counter(transport).fetch_add(1, Ordering::AcqRel);
        self.total_opened.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Registered {} ({}) from {}", id, transport, peer);

        ConnectionHandle {
            entry,
            registry: Arc::clone(self),
        }
    }

    /// Snapshot of a single record, if still retained
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.entries.read().get(&id).map(|e| e.snapshot())
    }

    /// Snapshot of every retained record, ordered by id
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let entries = self.entries.read();
        let mut records: Vec<ConnectionRecord> = entries.values().map(|e| e.snapshot()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Number of ACTIVE connections, optionally for one transport only
    pub fn active_count(&self, transport: Option<TransportKind>) -> usize {
        match transport {
            Some(kind) => self.active_counter(kind).load(Ordering::Acquire),
            None => {
                self.active_plain.load(Ordering::Acquire) + self.active_tls.load(Ordering::Acquire)
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_plain: self.active_plain.load(Ordering::Acquire),
            active_tls: self.active_tls.load(Ordering::Acquire),
            total_opened: self.total_opened.load(Ordering::Relaxed),
            closed_retained: self.closed_order.lock().len(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn active_counter(&self, transport: TransportKind) -> &AtomicUsize {
        match transport {
            TransportKind::PlainTcp => &self.active_plain,
            TransportKind::TlsTcp => &self.active_tls,
        }
    }

    fn on_closed(&self, entry: &ConnectionEntry) {
        self.active_counter(entry.transport)
            .fetch_sub(1, Ordering::AcqRel);

        let evicted: Vec<ConnectionId> = {
            let mut order = self.closed_order.lock();
            order.push_back(entry.id);
            let excess = order.len().saturating_sub(self.max_closed);
            order.drain(..excess).collect()
        };

        if !evicted.is_empty() {
            let mut entries = self.entries.write();
            for id in &evicted {
                entries.remove(id);
            }
            tracing::trace!("Evicted {} closed record(s)", evicted.len());
        }
    }
}

/// Owning handle to one registry record
///
/// Held by exactly one session. It is the only way to mutate the record's
/// byte counters or close it.
pub struct ConnectionHandle {
    entry: Arc<ConnectionEntry>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.entry.id
    }

    pub fn transport(&self) -> TransportKind {
        self.entry.transport
    }

    pub fn peer(&self) -> SocketAddr {
        self.entry.peer
    }

    pub fn tls(&self) -> Option<&TlsInfo> {
        self.entry.tls.as_ref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.entry.bytes_sent.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.entry.bytes_received.load(Ordering::Acquire)
    }

    /// Account for bytes successfully written to the peer
    pub fn add_sent(&self, n: usize) {
        let n = n as u64;
        self.entry.bytes_sent.fetch_add(n, Ordering::AcqRel);
        self.registry.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Account for bytes successfully read from the peer
    pub fn add_received(&self, n: usize) {
        let n = n as u64;
        self.entry.bytes_received.fetch_add(n, Ordering::AcqRel);
        self.registry
            .bytes_received
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionRecord {
        self.entry.snapshot()
    }

    /// Transition ACTIVE → CLOSED
    ///
    /// Returns the final record on the first call and `None` on every later
    /// call.
    pub fn close(&self, reason: CloseReason) -> Option<ConnectionRecord> {
        {
            let mut closure = self.entry.closure.lock();
            if closure.is_some() {
                return None;
            }
            *closure = Some(Closure {
                ended_at: Local::now(),
                reason,
            });
        }
        self.registry.on_closed(&self.entry);
        Some(self.entry.snapshot())
    }
}
