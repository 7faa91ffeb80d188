//! Request/response correlation.
//!
//! Every outstanding request lives in a single map keyed by correlation id.
//! Removing an entry from that map is the only way to resolve it, so whichever
//! of response arrival, timeout, cancellation or drain removes it first decides
//! the outcome and the others find nothing to do.

use crate::error::{Error, Result};
use crate::message::Message;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome delivered to the waiter of a request.
type Outcome = Result<Message>;

/// In-memory record of a request awaiting resolution.
#[derive(Debug)]
pub struct PendingRequest {
    message: Message,
    deadline: Instant,
    timeout: Duration,
    attempt: u32,
    resolver: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    /// The outgoing message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// When the current attempt times out.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The current attempt number, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consumes the record, so a request can only ever be resolved once.
    fn complete(self, outcome: Outcome) {
        self.timer.abort();
        // The waiter may have gone away; nothing left to notify then
        let _ = self.resolver.send(outcome);
    }
}

/// Receiving side of a registered request.
///
/// Also a future, so it can be polled by reference inside `select!`.
#[derive(Debug)]
pub struct Resolution {
    rx: oneshot::Receiver<Outcome>,
}

impl Resolution {
    /// Wait until the request is resolved.
    ///
    /// # Errors
    ///
    /// Returns whatever error the request was resolved with, or
    /// `ConnectionClosed` if the correlator went away first.
    pub async fn wait(self) -> Outcome {
        self.await
    }
}

impl Future for Resolution {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(Error::ConnectionClosed(
                    crate::connection::DisconnectReason::Dropped,
                ))
            })
        })
    }
}

struct Inner {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
}

/// Tracks outstanding requests by correlation id.
///
/// Cloning is cheap; clones share the same outstanding set.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a request under a fresh correlation id and arm its timeout.
    pub fn register(&self, message: Message, timeout: Duration) -> (u64, Resolution) {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let deadline = Instant::now() + timeout;
            if let Some(resolution) = self.insert(id, message.clone(), deadline, timeout, 1) {
                debug!(
                    "Registered request {} (outstanding: {})",
                    id,
                    self.inner.pending.len()
                );
                return (id, resolution);
            }
        }
    }

    /// Register a further attempt of a request under its existing id.
    ///
    /// The attempt starts after `delay`, and its deadline is `timeout` after
    /// that. The request stays outstanding in between, so a late response,
    /// a cancel or a drain still reaches it. Returns `None` if the id is
    /// taken.
    pub fn reregister(
        &self,
        id: u64,
        message: Message,
        timeout: Duration,
        attempt: u32,
        delay: Duration,
    ) -> Option<Resolution> {
        let deadline = Instant::now() + delay + timeout;
        let resolution = self.insert(id, message, deadline, timeout, attempt)?;
        debug!(
            "Re-registered request {} for attempt {} starting in {:?}",
            id, attempt, delay
        );
        Some(resolution)
    }

    fn insert(
        &self,
        id: u64,
        message: Message,
        deadline: Instant,
        timeout: Duration,
        attempt: u32,
    ) -> Option<Resolution> {
        match self.inner.pending.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (resolver, rx) = oneshot::channel();
                // Holding the vacant entry keeps the timer from observing the
                // map before the request is in it
                let timer = self.arm(id, attempt, deadline);
                entry.insert(PendingRequest {
                    message,
                    deadline,
                    timeout,
                    attempt,
                    resolver,
                    timer,
                });
                Some(Resolution { rx })
            }
        }
    }

    fn arm(&self, id: u64, attempt: u32, deadline: Instant) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                Self { inner }.expire(id, attempt);
            }
        })
    }

    /// Resolve a request with a response or a terminal error.
    ///
    /// Responses for ids that are not outstanding (already resolved,
    /// cancelled, or never issued) are discarded. Returns whether a request
    /// was resolved.
    pub fn resolve(&self, id: u64, response: Outcome) -> bool {
        if let Some((_, pending)) = self.inner.pending.remove(&id) {
            debug!("Resolved request {} on attempt {}", id, pending.attempt);
            pending.complete(response);
            true
        } else {
            warn!("Discarding response for unknown request {}", id);
            false
        }
    }

    /// Resolve a request with a timeout error if it is still outstanding.
    pub fn timeout_fire(&self, id: u64) -> bool {
        self.inner
            .pending
            .remove(&id)
            .map(|(_, pending)| {
                debug!("Request {} timed out", id);
                let timeout = pending.timeout;
                pending.complete(Err(Error::Timeout(timeout)));
            })
            .is_some()
    }

    /// Timer path: only the attempt that armed the timer may be expired.
    fn expire(&self, id: u64, attempt: u32) {
        if let Some((_, pending)) = self
            .inner
            .pending
            .remove_if(&id, |_, pending| pending.attempt == attempt)
        {
            debug!("Request {} timed out on attempt {}", id, attempt);
            let timeout = pending.timeout;
            pending.complete(Err(Error::Timeout(timeout)));
        }
    }

    /// Cancel a request if it is still outstanding.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner
            .pending
            .remove(&id)
            .map(|(_, pending)| {
                debug!("Request {} cancelled", id);
                pending.complete(Err(Error::Cancelled));
            })
            .is_some()
    }

    /// Fail `attempt` of a request whose frame never reached the peer.
    ///
    /// Does nothing if the request has moved on to a later attempt.
    pub fn reject(&self, id: u64, attempt: u32, error: Error) -> bool {
        self.inner
            .pending
            .remove_if(&id, |_, pending| pending.attempt == attempt)
            .map(|(_, pending)| {
                debug!("Request {} failed on attempt {}: {}", id, attempt, error);
                pending.complete(Err(error));
            })
            .is_some()
    }

    /// Resolve every outstanding request with `error`.
    ///
    /// Returns the number of requests drained.
    pub fn drain_all(&self, error: &Error) -> usize {
        let ids: Vec<u64> = self
            .inner
            .pending
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let drained = ids
            .into_iter()
            .filter_map(|id| self.inner.pending.remove(&id))
            .map(|(_, pending)| pending.complete(Err(error.clone())))
            .count();

        if drained > 0 {
            debug!("Drained {} outstanding requests: {}", drained, error);
        }
        drained
    }

    /// Whether a request with this id is outstanding.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.inner.pending.contains_key(&id)
    }

    /// Current attempt of an outstanding request.
    #[must_use]
    pub fn attempt(&self, id: u64) -> Option<u32> {
        self.inner.pending.get(&id).map(|pending| pending.attempt())
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("outstanding", &self.inner.pending.len())
            .finish()
    }
}
