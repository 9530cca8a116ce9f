//! Command client
//!
//! Client end of the line protocol, for both transports. Connecting reads the
//! welcome message; after that every [`CommandClient::send`] is one request
//! line and one response object.

use std::path::Path;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::TlsConnector;

use crate::error::NethubError;
use crate::protocol::{
    CommandResponse, FrameError, FrameReader, FrameWriter, DEFAULT_MAX_LINE_BYTES,
};
use crate::registry::TlsInfo;
use crate::tls::{client_config, describe_session};

/// Any byte stream the client can run over
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

type BoxedStream = Box<dyn ClientStream>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] NethubError),

    #[error("Invalid server name: {0}")]
    ServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Server closed the connection")]
    Closed,
}

pub struct CommandClient {
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
    welcome: CommandResponse,
    tls: Option<TlsInfo>,
}

impl CommandClient {
    /// Connect over plain TCP and read the welcome
    pub async fn connect_plain<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        Self::handshake(Box::new(stream), None).await
    }

    /// Connect over TLS, trusting the certificate(s) in `ca_cert`
    pub async fn connect_tls<A: ToSocketAddrs>(
        addr: A,
        server_name: &str,
        ca_cert: &Path,
    ) -> Result<Self, ClientError> {
        let connector = TlsConnector::from(client_config(ca_cert)?);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ClientError::ServerName(server_name.to_string()))?;

        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let tls_stream = connector
            .connect(name, stream)
            .await
            .map_err(ClientError::Handshake)?;
        let info = describe_session(tls_stream.get_ref().1);

        Self::handshake(Box::new(tls_stream), Some(info)).await
    }

    async fn handshake(stream: BoxedStream, tls: Option<TlsInfo>) -> Result<Self, ClientError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, DEFAULT_MAX_LINE_BYTES);
        let writer = FrameWriter::new(write_half);

        let welcome = reader
            .next_json::<CommandResponse>()
            .await?
            .ok_or(ClientError::Closed)?;

        Ok(Self {
            reader,
            writer,
            welcome,
            tls,
        })
    }

    pub fn welcome(&self) -> &CommandResponse {
        &self.welcome
    }

    /// Negotiated TLS parameters as seen by the client
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Send one command and wait for its response
    pub async fn send(&mut self, command: &str) -> Result<CommandResponse, ClientError> {
        self.writer.send_line(command).await?;
        self.recv().await
    }

    /// Next response line from the server
    pub async fn recv(&mut self) -> Result<CommandResponse, ClientError> {
        self.reader
            .next_json::<CommandResponse>()
            .await?
            .ok_or(ClientError::Closed)
    }

    /// True once the server has closed its side
    pub async fn at_eof(&mut self) -> Result<bool, ClientError> {
        Ok(self.reader.next_line().await.map_err(FrameError::from)?.is_none())
    }

    /// Shut down the write side without sending a close command
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await.map_err(FrameError::from)?;
        Ok(())
    }
}
