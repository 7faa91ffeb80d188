//! Byte-level transport abstraction.
//!
//! The engine never opens sockets itself. A [`Connector`] hands out a fresh
//! [`Transport`] whenever the connection is opened, and the connection only
//! ever talks to the peer through the three primitives below.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Errors reported by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,

    /// The transport could not be established.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// A duplex byte stream to the remote peer.
///
/// Reads and writes may be issued concurrently from different tasks; the
/// connection guarantees that at most one write and one read are in flight
/// at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write all of `bytes` to the peer.
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Read the next chunk of bytes.
    ///
    /// Chunks need not align with frame boundaries. `Ok(None)` signals a
    /// clean end of stream.
    async fn read(&self) -> Result<Option<Bytes>, TransportError>;

    /// Release the transport. Pending and later reads end.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Acquires transports for a connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new transport to the peer.
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
