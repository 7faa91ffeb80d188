//! In-memory transport for the MCP client.
//!
//! [`MemoryTransport::pair`] creates two connected endpoints inside one
//! process. One side is handed to a client through a [`MemoryConnector`],
//! the other is driven by the test or service playing the peer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_mcp::{Connector, Transport, TransportError};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

struct Endpoint {
    id: u64,
    sender: Mutex<Option<flume::Sender<Bytes>>>,
    receiver: Mutex<Option<flume::Receiver<Bytes>>>,
    closed: CancellationToken,
    failing_writes: AtomicU32,
}

/// One end of an in-memory duplex byte stream.
///
/// Clones refer to the same endpoint, so a test can keep a handle on the
/// side it gave away.
#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: Arc<Endpoint>,
}

impl MemoryTransport {
    /// Create two connected endpoints.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_to_b_tx, a_to_b_rx) = flume::unbounded();
        let (b_to_a_tx, b_to_a_rx) = flume::unbounded();

        (Self::new(a_to_b_tx, b_to_a_rx), Self::new(b_to_a_tx, a_to_b_rx))
    }

    fn new(sender: flume::Sender<Bytes>, receiver: flume::Receiver<Bytes>) -> Self {
        Self {
            endpoint: Arc::new(Endpoint {
                id: NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed),
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                closed: CancellationToken::new(),
                failing_writes: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` writes on this endpoint fail with an I/O error
    /// without delivering anything.
    pub fn fail_next_writes(&self, count: u32) {
        self.endpoint.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Whether this endpoint has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.endpoint.closed.is_cancelled()
    }

    fn take_failure(&self) -> bool {
        self.endpoint
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.endpoint.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.take_failure() {
            debug!("Memory endpoint {} failing write on request", self.endpoint.id);
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }

        let sender = self
            .endpoint
            .sender
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;

        debug!(
            "Memory endpoint {} sending {} bytes",
            self.endpoint.id,
            bytes.len()
        );

        sender
            .send_async(bytes)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn read(&self) -> Result<Option<Bytes>, TransportError> {
        let receiver = self
            .endpoint
            .receiver
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;

        tokio::select! {
            () = self.endpoint.closed.cancelled() => Err(TransportError::Closed),
            received = receiver.recv_async() => match received {
                Ok(bytes) => Ok(Some(bytes)),
                // Every sender on the peer side is gone: clean end of stream
                Err(flume::RecvError::Disconnected) => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing memory endpoint {}", self.endpoint.id);
        self.endpoint.closed.cancel();
        self.endpoint.sender.lock().take();
        self.endpoint.receiver.lock().take();
        Ok(())
    }
}

/// Hands out pre-created endpoints, one per connect.
///
/// Connecting fails once the queue is exhausted.
#[derive(Clone, Debug, Default)]
pub struct MemoryConnector {
    endpoints: Arc<Mutex<VecDeque<MemoryTransport>>>,
}

impl MemoryConnector {
    /// Create a connector that yields `endpoints` in order.
    #[must_use]
    pub fn new(endpoints: impl IntoIterator<Item = MemoryTransport>) -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(endpoints.into_iter().collect())),
        }
    }

    /// Queue another endpoint.
    pub fn push(&self, endpoint: MemoryTransport) {
        self.endpoints.lock().push_back(endpoint);
    }

    /// Number of endpoints not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.endpoints.lock().len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let endpoint = self
            .endpoints
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::ConnectFailed("no memory endpoint available".to_string()))?;

        debug!("Memory connector handing out endpoint {}", endpoint.endpoint.id);
        Ok(Box::new(endpoint))
    }
}
