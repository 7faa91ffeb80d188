//! Error types for the protocol engine.

use crate::connection::{ConnectionState, DisconnectReason};
use crate::transport::TransportError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Underlying cause attached to an error.
///
/// Shared so that a single failure can be handed to every request drained
/// by a connection teardown.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for protocol operations.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// I/O failure while talking to the remote peer.
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable description.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<Cause>,
    },

    /// Malformed frame or unsupported version.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The request deadline elapsed before a response arrived.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A send was attempted while the connection was not connected.
    #[error("Not connected (connection is {0})")]
    NotConnected(ConnectionState),

    /// The outgoing message cannot be sent as-is.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The connection was torn down while the request was outstanding.
    #[error("Connection closed: {0}")]
    ConnectionClosed(DisconnectReason),

    /// A lifecycle operation was invoked in a state that does not allow it.
    #[error("Operation not allowed while connection is {0}")]
    InvalidState(ConnectionState),
}

impl Error {
    /// Build a transport error without an underlying cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Build a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// The kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from(TransportError::Io(err))
    }
}

/// Field-less classification of [`Error`], used for retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::Protocol`].
    Protocol,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::NotConnected`].
    NotConnected,
    /// See [`Error::Validation`].
    Validation,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::ConnectionClosed`].
    ConnectionClosed,
    /// See [`Error::InvalidState`].
    InvalidState,
}

impl ErrorKind {
    /// Whether errors of this kind describe the connection rather than a
    /// single request.
    #[must_use]
    pub const fn is_connection_level(self) -> bool {
        matches!(self, Self::Transport | Self::ConnectionClosed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::NotConnected => "not-connected",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::ConnectionClosed => "connection-closed",
            Self::InvalidState => "invalid-state",
        };
        f.write_str(name)
    }
}
