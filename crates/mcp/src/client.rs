//! The client-facing dispatcher.
//!
//! [`McpClient`] ties the pieces together: it registers each request with the
//! correlator, writes its frame through the connection and drives retries
//! according to the retry policy until the request resolves.

use crate::codec::{self, Frame, FrameCodec};
use crate::connection::{Connection, ConnectionConfig, ConnectionState, DisconnectReason};
use crate::correlator::{Correlator, Resolution};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventNotifier};
use crate::message::Message;
use crate::retry::RetryPolicy;
use crate::transport::Connector;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Per-attempt request timeout used unless a send overrides it.
    pub default_timeout: Duration,
    /// Retry policy used unless a send overrides it.
    pub retry_policy: RetryPolicy,
    /// Upper bound on acquiring a transport.
    pub connect_timeout: Duration,
    /// Largest frame sent or accepted, excluding the length prefix.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// Builder for [`McpClient`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the default retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a disconnected client that acquires transports from `connector`.
    #[must_use]
    pub fn build(self, connector: impl Connector) -> McpClient {
        McpClient::with_config(connector, self.config)
    }
}

/// Per-send overrides of the client defaults.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Retry policy.
    pub retry_policy: Option<RetryPolicy>,
}

impl RequestOptions {
    /// Override the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// A resolved request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    correlation_id: u64,
    message: Message,
    attempts: u32,
}

impl Response {
    /// Correlation id the response was matched on.
    #[must_use]
    pub const fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// The peer's reply.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Consume the response, returning the reply.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Number of attempts it took, including the successful one.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Handle to a request sent with [`McpClient::send_message_async`].
///
/// Await it for the outcome. Dropping the handle does not cancel the
/// request; call [`ResponseHandle::cancel`] for that.
#[derive(Debug)]
pub struct ResponseHandle {
    id: Option<u64>,
    correlator: Correlator,
    cancel: CancellationToken,
    task: JoinHandle<Result<Response>>,
}

impl ResponseHandle {
    /// Correlation id of the request, if it got far enough to be registered.
    #[must_use]
    pub const fn id(&self) -> Option<u64> {
        self.id
    }

    /// Cancel the request. The handle then resolves with `Cancelled` unless
    /// it already resolved.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(id) = self.id {
            self.correlator.cancel(id);
        }
    }

    /// Whether the outcome is ready.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for ResponseHandle {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.task.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
        }
    }
}

#[derive(Clone)]
struct Settings {
    default_timeout: Duration,
    retry_policy: RetryPolicy,
}

/// A registered request, ready for its first attempt.
struct Prepared {
    id: u64,
    frame: Bytes,
    message: Message,
    timeout: Duration,
    policy: RetryPolicy,
    resolution: Resolution,
}

struct ClientInner {
    connection: Arc<Connection>,
    correlator: Correlator,
    notifier: Arc<EventNotifier>,
    settings: RwLock<Settings>,
    max_frame_size: usize,
}

/// A client for one logical connection to an MCP peer.
///
/// Cloning is cheap and clones share the connection. When the last clone is
/// dropped the connection is torn down and outstanding requests resolve with
/// `ConnectionClosed`.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    /// Create a client with the default configuration.
    #[must_use]
    pub fn new(connector: impl Connector) -> Self {
        Self::with_config(connector, ClientConfig::default())
    }

    /// Start building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client with an explicit configuration.
    #[must_use]
    pub fn with_config(connector: impl Connector, config: ClientConfig) -> Self {
        let correlator = Correlator::new();
        let notifier = Arc::new(EventNotifier::new());
        let connection = Arc::new(Connection::new(
            Arc::new(connector),
            correlator.clone(),
            Arc::clone(&notifier),
            ConnectionConfig {
                connect_timeout: config.connect_timeout,
                max_frame_size: config.max_frame_size,
            },
        ));

        Self {
            inner: Arc::new(ClientInner {
                connection,
                correlator,
                notifier,
                settings: RwLock::new(Settings {
                    default_timeout: config.default_timeout,
                    retry_policy: config.retry_policy,
                }),
                max_frame_size: config.max_frame_size,
            }),
        }
    }

    /// Connect to the peer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if not disconnected, or the connect failure.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.open().await
    }

    /// Disconnect from the peer, resolving outstanding requests with
    /// `ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// Currently infallible; transport close failures are logged.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.connection.close().await
    }

    /// Whether the client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Set the callback run after each successful connect.
    pub fn set_on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.notifier.set_on_connect(callback);
    }

    /// Set the callback run when the connection goes away.
    pub fn set_on_disconnect(&self, callback: impl Fn(&DisconnectReason) + Send + Sync + 'static) {
        self.inner.notifier.set_on_disconnect(callback);
    }

    /// Set the callback run for connection-level errors.
    pub fn set_on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.inner.notifier.set_on_error(callback);
    }

    /// Set the default per-attempt timeout for later sends.
    pub fn set_timeout(&self, timeout: Duration) -> &Self {
        self.inner.settings.write().default_timeout = timeout;
        self
    }

    /// Set the default retry policy for later sends.
    pub fn set_retry_policy(&self, policy: RetryPolicy) -> &Self {
        self.inner.settings.write().retry_policy = policy;
        self
    }

    /// The default per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.settings.read().default_timeout
    }

    /// The default retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.settings.read().retry_policy.clone()
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `Validation` or `NotConnected` before anything is sent,
    /// otherwise the terminal error once retries are exhausted.
    pub async fn send_message(&self, message: Message) -> Result<Response> {
        self.send_message_with_options(message, RequestOptions::default())
            .await
    }

    /// Like [`McpClient::send_message`], with per-send overrides.
    ///
    /// # Errors
    ///
    /// See [`McpClient::send_message`].
    #[instrument(skip(self, message, options), fields(context = %message.context()))]
    pub async fn send_message_with_options(
        &self,
        message: Message,
        options: RequestOptions,
    ) -> Result<Response> {
        let prepared = self.inner.prepare(message, options)?;
        let id = prepared.id;

        // Leaves nothing behind in the correlator if the caller gives up
        let cancel = CancellationToken::new();
        let _guard = CancelOnDrop {
            id,
            correlator: &self.inner.correlator,
            cancel: &cancel,
        };

        self.inner.dispatch().drive(prepared, &cancel).await
    }

    /// Send a request without waiting for its response.
    ///
    /// Errors detected before sending are delivered through the handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn send_message_async(&self, message: Message) -> ResponseHandle {
        self.send_message_async_with_options(message, RequestOptions::default())
    }

    /// Like [`McpClient::send_message_async`], with per-send overrides.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn send_message_async_with_options(
        &self,
        message: Message,
        options: RequestOptions,
    ) -> ResponseHandle {
        let cancel = CancellationToken::new();

        let (id, task) = match self.inner.prepare(message, options) {
            Ok(prepared) => {
                let id = prepared.id;
                let dispatch = self.inner.dispatch();
                let token = cancel.clone();
                let task = tokio::spawn(async move { dispatch.drive(prepared, &token).await });
                (Some(id), task)
            }
            Err(e) => (None, tokio::spawn(async move { Err(e) })),
        };

        ResponseHandle {
            id,
            correlator: self.inner.correlator.clone(),
            cancel,
            task,
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn prepare(&self, message: Message, options: RequestOptions) -> Result<Prepared> {
        let Settings {
            default_timeout,
            retry_policy,
        } = self.settings.read().clone();
        let timeout = options.timeout.unwrap_or(default_timeout);
        let policy = options.retry_policy.unwrap_or(retry_policy);

        message.validate()?;

        let len = codec::frame_len(&message);
        if len > self.max_frame_size {
            return Err(Error::validation(format!(
                "frame size {len} exceeds maximum {}",
                self.max_frame_size
            )));
        }

        let state = self.connection.state();
        if state != ConnectionState::Connected {
            return Err(Error::NotConnected(state));
        }

        let (id, resolution) = self.correlator.register(message.clone(), timeout);
        let frame = match self.encode(id, &message) {
            Ok(frame) => frame,
            Err(e) => {
                self.correlator.reject(id, 1, e.clone());
                return Err(e);
            }
        };

        Ok(Prepared {
            id,
            frame,
            message,
            timeout,
            policy,
            resolution,
        })
    }

    fn encode(&self, id: u64, message: &Message) -> Result<Bytes> {
        FrameCodec::new()
            .with_max_frame_size(self.max_frame_size)
            .encode_frame(&Frame::new(id, message.clone()))
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch {
            connection: Arc::downgrade(&self.connection),
            correlator: self.correlator.clone(),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

/// Everything a registered send needs to run its attempts.
///
/// The connection is held weakly so sends still in flight never keep a
/// dropped client's connection alive.
struct Dispatch {
    connection: Weak<Connection>,
    correlator: Correlator,
    notifier: Arc<EventNotifier>,
}

impl Dispatch {
    /// Run attempts until the request resolves or fails terminally.
    ///
    /// Between attempts the request stays registered, so the backoff ends
    /// early if the request is drained, cancelled or answered late.
    async fn drive(&self, prepared: Prepared, cancel: &CancellationToken) -> Result<Response> {
        let Prepared {
            id,
            frame,
            message,
            timeout,
            policy,
            resolution,
        } = prepared;
        let mut attempt = 1;
        let mut outcome = self
            .run(id, attempt, frame.clone(), resolution, cancel)
            .await;

        loop {
            let error = match outcome {
                Ok(reply) => {
                    debug!("Request {} answered after {} attempt(s)", id, attempt);
                    return Ok(Response {
                        correlation_id: id,
                        message: reply,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            let Some(delay) = policy.should_retry(error.kind(), attempt) else {
                // Drains are reported once by the connection itself
                if error.kind() == ErrorKind::Transport {
                    self.notifier.emit(Event::Error(error.clone()));
                }
                debug!("Request {} failed after {} attempt(s): {}", id, attempt, error);
                return Err(error);
            };

            warn!(
                "Request {} attempt {} failed ({}), retrying in {:?}",
                id, attempt, error, delay
            );

            let mut next = self
                .correlator
                .reregister(id, message.clone(), timeout, attempt + 1, delay)
                .ok_or_else(|| {
                    Error::protocol(format!("correlation id {id} is already outstanding"))
                })?;

            let early = tokio::select! {
                () = tokio::time::sleep(delay) => None,
                // Resolved before the next frame went out
                early = &mut next => Some(early),
                () = cancel.cancelled() => {
                    self.correlator.cancel(id);
                    Some(Err(Error::Cancelled))
                }
            };

            outcome = match early {
                Some(early) => early,
                None => {
                    attempt += 1;
                    self.run(id, attempt, frame.clone(), next, cancel).await
                }
            };
        }
    }

    /// An attempt raced against cancellation.
    async fn run(
        &self,
        id: u64,
        attempt: u32,
        frame: Bytes,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        tokio::select! {
            outcome = self.attempt(id, attempt, frame, resolution) => outcome,
            () = cancel.cancelled() => {
                self.correlator.cancel(id);
                Err(Error::Cancelled)
            }
        }
    }

    /// One attempt: hand the frame to the connection, then wait for whatever
    /// resolves the request first.
    #[instrument(skip(self, frame, resolution))]
    async fn attempt(
        &self,
        id: u64,
        attempt: u32,
        frame: Bytes,
        resolution: Resolution,
    ) -> Result<Message> {
        let Some(connection) = self.connection.upgrade() else {
            let error = Error::ConnectionClosed(DisconnectReason::Dropped);
            self.correlator.reject(id, attempt, error);
            return resolution.await;
        };
        let correlator = self.correlator.clone();

        // Writes run to completion on their own task so a timeout or cancel
        // never leaves half a frame on the wire
        tokio::spawn(async move {
            if let Err(e) = connection.write(frame).await {
                correlator.reject(id, attempt, e);
            }
        });

        resolution.await
    }
}

/// Cancels a blocking send whose future is dropped before it resolves.
struct CancelOnDrop<'a> {
    id: u64,
    correlator: &'a Correlator,
    cancel: &'a CancellationToken,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.correlator.cancel(self.id);
    }
}
