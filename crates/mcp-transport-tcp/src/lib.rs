//! TCP transport for the MCP client.
//!
//! This crate provides a [`Connector`] that opens a `tokio` TCP stream per
//! connection attempt. Frames are already length-prefixed by the engine, so
//! the transport moves raw bytes and never inspects them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use proven_mcp::{Connector, Transport, TransportError};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// TCP-specific configuration
#[derive(Clone, Copy, Debug)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm on new streams
    pub nodelay: bool,
    /// Capacity reserved for each read
    pub read_buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            read_buffer_size: 64 * 1024,
        }
    }
}

/// A connected TCP stream.
///
/// The halves are locked separately so a pending read never holds up a write.
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    read_buffer_size: usize,
}

impl TcpTransport {
    /// Wrap an established stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream options cannot be applied.
    pub fn new(stream: TcpStream, config: TcpConfig) -> Result<Self, TransportError> {
        stream.set_nodelay(config.nodelay)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_buffer_size: config.read_buffer_size.max(1),
        })
    }

    /// Address of the remote peer.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);

        if reader.read_buf(&mut buf).await? == 0 {
            debug!("Peer {} closed the stream", self.peer);
            return Ok(None);
        }

        Ok(Some(buf.freeze()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Shutting down stream to {}", self.peer);
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Opens a fresh TCP stream to a fixed address on every connect.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: SocketAddr,
    config: TcpConfig,
}

impl TcpConnector {
    /// Create a connector for `addr` with default options.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_config(addr, TcpConfig::default())
    }

    /// Create a connector for `addr` with explicit options.
    #[must_use]
    pub const fn with_config(addr: SocketAddr, config: TcpConfig) -> Self {
        Self { addr, config }
    }

    /// Address connections are made to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.addr)))?;

        info!("TCP connection established to {}", self.addr);
        Ok(Box::new(TcpTransport::new(stream, self.config)?))
    }
}
