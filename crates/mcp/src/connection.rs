//! Connection lifecycle and the background read loop.

use crate::codec::{self, FrameCodec};
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::events::{Event, EventNotifier};
use crate::transport::{Connector, Transport};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport is held.
    Disconnected,
    /// A transport is being acquired.
    Connecting,
    /// The transport is live and the read loop is running.
    Connected,
    /// An explicit close is in progress.
    Closing,
    /// The handshake or the transport failed; teardown is in progress.
    Failed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Failed | Self::Closing)
                | (Self::Connected, Self::Closing | Self::Failed)
                | (Self::Closing | Self::Failed, Self::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a connection went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request.
    Closed,
    /// The transport could not be established.
    ConnectFailed(String),
    /// Reading from the transport failed.
    TransportFailure(String),
    /// The peer ended the stream.
    RemoteClosed,
    /// The peer sent bytes that cannot be framed.
    ProtocolViolation(String),
    /// The connection was dropped without being closed.
    Dropped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            Self::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
            Self::RemoteClosed => f.write_str("closed by remote peer"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::Dropped => f.write_str("dropped"),
        }
    }
}

/// Settings used when opening a connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Upper bound on acquiring a transport.
    pub connect_timeout: Duration,
    /// Largest frame accepted from the peer, excluding the length prefix.
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// The live half of a connection: one transport and the task reading from it.
struct Session {
    id: u64,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

/// One logical connection to the peer.
///
/// Holds at most one live transport. State transitions are serialized by an
/// async lifecycle lock; the current state itself sits behind a cheap sync
/// lock so senders and the read loop can check it without waiting on a
/// transition in progress.
pub struct Connection {
    connector: Arc<dyn Connector>,
    correlator: Correlator,
    notifier: Arc<EventNotifier>,
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    writer: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
}

impl Connection {
    /// Create a disconnected connection.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        correlator: Correlator,
        notifier: Arc<EventNotifier>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            connector,
            correlator,
            notifier,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            lifecycle: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            writer: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.write();
        debug_assert!(
            state.can_transition_to(next),
            "invalid transition {} -> {}",
            *state,
            next
        );
        debug!("Connection state {} -> {}", *state, next);
        *state = next;
    }

    /// Acquire a transport and start the read loop.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless disconnected, or the connect failure.
    #[instrument(skip(self))]
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let current = self.state();
        if current != ConnectionState::Disconnected {
            return Err(Error::InvalidState(current));
        }

        self.transition(ConnectionState::Connecting);

        let transport: Arc<dyn Transport> =
            match timeout(self.config.connect_timeout, self.connector.connect()).await {
                Ok(Ok(transport)) => Arc::from(transport),
                Ok(Err(e)) => return Err(self.abort_open(e.into())),
                Err(_) => return Err(self.abort_open(Error::Timeout(self.config.connect_timeout))),
            };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();

        *self.session.lock() = Some(Session {
            id,
            transport: Arc::clone(&transport),
            shutdown: shutdown.clone(),
            reader: None,
        });

        // Readers only run while connected, so flip the state first
        self.transition(ConnectionState::Connected);

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            id,
            transport,
            self.correlator.clone(),
            Arc::clone(&self.state),
            shutdown,
            FrameCodec::new().with_max_frame_size(self.config.max_frame_size),
        ));

        if let Some(session) = self.session.lock().as_mut() {
            session.reader = Some(reader);
        }

        info!("Connection established (session {})", id);
        self.notifier.emit(Event::Connected);
        Ok(())
    }

    fn abort_open(&self, error: Error) -> Error {
        warn!("Failed to connect: {}", error);
        self.transition(ConnectionState::Failed);
        self.transition(ConnectionState::Disconnected);

        self.notifier.emit(Event::Error(error.clone()));
        self.notifier.emit(Event::Disconnected(DisconnectReason::ConnectFailed(
            error.to_string(),
        )));
        error
    }

    /// Stop the read loop, release the transport and drain outstanding
    /// requests. Closing a disconnected connection does nothing.
    ///
    /// # Errors
    ///
    /// Currently infallible; transport close failures are logged.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            state => {
                debug!("Close requested while {}", state);
                return Ok(());
            }
        }

        self.transition(ConnectionState::Closing);

        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.shutdown.cancel();
            if let Some(reader) = session.reader.take() {
                reader.abort();
            }
            if let Err(e) = session.transport.close().await {
                warn!("Failed to close transport cleanly: {}", e);
            }
        }

        self.transition(ConnectionState::Disconnected);

        let reason = DisconnectReason::Closed;
        let drained = self
            .correlator
            .drain_all(&Error::ConnectionClosed(reason.clone()));
        info!("Connection closed ({} requests drained)", drained);

        self.notifier.emit(Event::Disconnected(reason));
        Ok(())
    }

    /// Write one encoded frame. Concurrent writes are serialized.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless connected, or the transport failure.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        let transport = self.live_transport()?;

        let _writer = self.writer.lock().await;
        // The connection may have gone away while waiting for the writer
        if !self.is_connected() {
            return Err(Error::NotConnected(self.state()));
        }

        transport.write(bytes).await.map_err(Error::from)
    }

    fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::NotConnected(state));
        }

        self.session
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.transport))
            .ok_or(Error::NotConnected(state))
    }

    /// Tear down after the read loop of `session_id` hit `error`.
    async fn fail(&self, session_id: u64, reason: DisconnectReason, error: Error) {
        let _guard = self.lifecycle.lock().await;

        let session = {
            let mut current = self.session.lock();
            if current.as_ref().is_some_and(|session| session.id == session_id) {
                current.take()
            } else {
                None
            }
        };

        // A close or a newer session got there first
        let Some(session) = session else {
            return;
        };

        error!("Connection failed: {}", reason);
        self.transition(ConnectionState::Failed);

        session.shutdown.cancel();
        if let Err(e) = session.transport.close().await {
            debug!("Transport close after failure: {}", e);
        }

        self.transition(ConnectionState::Disconnected);

        let drained = self
            .correlator
            .drain_all(&Error::ConnectionClosed(reason.clone()));
        debug!("Drained {} requests after failure", drained);

        self.notifier.emit(Event::Error(error));
        self.notifier.emit(Event::Disconnected(reason));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.get_mut().take() {
            session.shutdown.cancel();
            if let Some(reader) = session.reader.take() {
                reader.abort();
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = session.transport;
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        debug!("Transport close on drop: {}", e);
                    }
                });
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.correlator
            .drain_all(&Error::ConnectionClosed(DisconnectReason::Dropped));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reads frames until cancelled or the transport fails.
async fn read_loop(
    connection: Weak<Connection>,
    session_id: u64,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    state: Arc<RwLock<ConnectionState>>,
    shutdown: CancellationToken,
    mut framer: FrameCodec,
) {
    let mut buf = BytesMut::new();

    let (reason, error) = loop {
        if *state.read() != ConnectionState::Connected {
            return;
        }

        let chunk = tokio::select! {
            () = shutdown.cancelled() => return,
            chunk = transport.read() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                buf.extend_from_slice(&bytes);
                if let Err(e) = route_frames(&mut framer, &mut buf, &correlator) {
                    break (DisconnectReason::ProtocolViolation(e.to_string()), e);
                }
            }
            Ok(None) => {
                let reason = DisconnectReason::RemoteClosed;
                break (reason.clone(), Error::ConnectionClosed(reason));
            }
            Err(e) => {
                break (DisconnectReason::TransportFailure(e.to_string()), e.into());
            }
        }
    };

    if let Some(connection) = connection.upgrade() {
        connection.fail(session_id, reason, error).await;
    }
}

/// Hand every complete frame in `buf` to the correlator.
///
/// A frame whose header names a request but whose payload cannot be parsed
/// fails that request with the protocol error. A frame without a readable
/// header is skipped. Only an untrustworthy length prefix is fatal.
fn route_frames(
    framer: &mut FrameCodec,
    buf: &mut BytesMut,
    correlator: &Correlator,
) -> Result<()> {
    while let Some(frame) = framer.decode(buf)? {
        match codec::decode(&frame) {
            Ok((id, message)) => {
                correlator.resolve(id, Ok(message));
            }
            Err(e) => match codec::decode_header(&frame) {
                Ok(id) => {
                    warn!("Malformed response for request {}: {}", id, e);
                    correlator.resolve(id, Err(e));
                }
                Err(_) => {
                    warn!("Skipping malformed frame of {} bytes: {}", frame.len(), e);
                }
            },
        }
    }
    Ok(())
}
