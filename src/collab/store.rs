//! Connection store
//!
//! Optional persistence of connection rows and lifecycle events.
//! [`SqliteStore`] keeps both in one SQLite file; every statement runs on the
//! blocking thread pool so sessions never wait on disk I/O directly.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::collab::sink::{EventLevel, EventSink};
use crate::registry::ConnectionRecord;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Persistence of connection rows
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert an ACTIVE row and return its store id
    async fn record_connection_opened(&self, record: &ConnectionRecord) -> Result<i64, StoreError>;

    /// Mark a row CLOSED with its final byte counts
    async fn record_connection_closed(
        &self,
        record_id: i64,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), StoreError>;
}

/// One row of the `connections` table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConnection {
    pub id: i64,
    pub tipo: String,
    pub ip_cliente: String,
    pub puerto_cliente: u16,
    pub estado: String,
    pub timestamp_fin: Option<String>,
    pub bytes_enviados: u64,
    pub bytes_recibidos: u64,
    pub cipher: Option<String>,
    pub tls_version: Option<String>,
}

/// SQLite-backed store and event sink
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tipo TEXT NOT NULL,
                ip_cliente TEXT NOT NULL,
                puerto_cliente INTEGER NOT NULL,
                ip_servidor TEXT NOT NULL,
                puerto_servidor INTEGER NOT NULL,
                estado TEXT NOT NULL,
                timestamp_inicio TEXT NOT NULL,
                timestamp_fin TEXT,
                bytes_enviados INTEGER DEFAULT 0,
                bytes_recibidos INTEGER DEFAULT 0,
                cipher TEXT,
                tls_version TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_connections_timestamp ON connections(timestamp_inicio);
            CREATE INDEX IF NOT EXISTS idx_connections_tipo ON connections(tipo);

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                nivel TEXT NOT NULL,
                servicio TEXT NOT NULL,
                mensaje TEXT NOT NULL,
                ip_origen TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_servicio ON logs(servicio);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }

    fn insert_log(
        conn: &Connection,
        level: EventLevel,
        service: &str,
        message: &str,
        peer: Option<IpAddr>,
        at: DateTime<Local>,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT INTO logs (nivel, servicio, mensaje, ip_origen, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                level.as_str(),
                service,
                message,
                peer.map(|p| p.to_string()),
                at.format(TIMESTAMP_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }

    pub async fn fetch_connection(&self, id: i64) -> Result<Option<StoredConnection>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, tipo, ip_cliente, puerto_cliente, estado, timestamp_fin,
                        bytes_enviados, bytes_recibidos, cipher, tls_version
                 FROM connections WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StoredConnection {
                        id: row.get(0)?,
                        tipo: row.get(1)?,
                        ip_cliente: row.get(2)?,
                        puerto_cliente: row.get(3)?,
                        estado: row.get(4)?,
                        timestamp_fin: row.get(5)?,
                        bytes_enviados: row.get::<_, i64>(6)? as u64,
                        bytes_recibidos: row.get::<_, i64>(7)? as u64,
                        cipher: row.get(8)?,
                        tls_version: row.get(9)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn count_connections(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM connections", [], |r| r.get(0)))
            .await
    }

    /// Number of stored log rows, optionally for one service
    pub async fn count_logs(&self, service: Option<&str>) -> Result<i64, StoreError> {
        let service = service.map(str::to_owned);
        self.with_conn(move |conn| match service {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE servicio = ?1",
                params![s],
                |r| r.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0)),
        })
        .await
    }
}

#[async_trait]
impl ConnectionStore for SqliteStore {
    async fn record_connection_opened(&self, record: &ConnectionRecord) -> Result<i64, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO connections
                    (tipo, ip_cliente, puerto_cliente, ip_servidor, puerto_servidor, estado,
                     timestamp_inicio, cipher, tls_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVA', ?6, ?7, ?8)",
                params![
                    record.transport.as_str().to_uppercase(),
                    record.peer_address.to_string(),
                    record.peer_port,
                    record.local_address.to_string(),
                    record.local_port,
                    record.started_at.format(TIMESTAMP_FORMAT).to_string(),
                    record.negotiated_cipher,
                    record.negotiated_protocol_version,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn record_connection_closed(
        &self,
        record_id: i64,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), StoreError> {
        let ended = Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connections
                 SET timestamp_fin = ?1, estado = 'CERRADA', bytes_enviados = ?2, bytes_recibidos = ?3
                 WHERE id = ?4",
                params![ended, bytes_sent as i64, bytes_received as i64, record_id],
            )?;
            Ok(())
        })
        .await
    }
}

impl EventSink for SqliteStore {
    fn log_event(&self, level: EventLevel, service: &str, message: &str, peer: Option<IpAddr>) {
        let at = Local::now();
        let service = service.to_string();
        let message = message.to_string();
        let conn = Arc::clone(&self.conn);

        let write = move || {
            if let Err(e) = Self::insert_log(&conn.lock(), level, &service, &message, peer, at) {
                tracing::warn!("Failed to store log event: {}", e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}
