//! Lifecycle event delivery.
//!
//! Events are queued and handed to the registered callbacks from a dedicated
//! task, so callbacks never run while connection or correlator state is
//! locked and a slow callback only delays later events. The queue is
//! unbounded; lifecycle events are rare.

use crate::connection::DisconnectReason;
use crate::error::Error;
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Callback invoked when a connection is established.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when a connection goes away.
pub type DisconnectCallback = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Callback invoked for connection-level errors.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// A lifecycle notification.
#[derive(Clone, Debug)]
pub enum Event {
    /// The connection was established.
    Connected,
    /// The connection went away.
    Disconnected(DisconnectReason),
    /// A connection-level error occurred.
    Error(Error),
}

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
}

/// Holds at most one callback per event kind and delivers events to them.
pub struct EventNotifier {
    callbacks: Arc<RwLock<Callbacks>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl EventNotifier {
    /// Create a notifier with no callbacks registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(RwLock::new(Callbacks::default())),
            queue: Mutex::new(None),
        }
    }

    /// Replace the connect callback.
    pub fn set_on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().on_connect = Some(Arc::new(callback));
    }

    /// Replace the disconnect callback.
    pub fn set_on_disconnect(&self, callback: impl Fn(&DisconnectReason) + Send + Sync + 'static) {
        self.callbacks.write().on_disconnect = Some(Arc::new(callback));
    }

    /// Replace the error callback.
    pub fn set_on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        self.callbacks.write().on_error = Some(Arc::new(callback));
    }

    /// Queue an event for delivery. Never blocks and never drops events.
    ///
    /// Outside a tokio runtime the event is delivered inline. The worker is
    /// started on first use and started again if its runtime has gone away.
    pub fn emit(&self, event: Event) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            deliver(&self.callbacks, event);
            return;
        };

        let mut queue = self.queue.lock();
        let event = match queue.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    debug!("Event worker is gone, restarting it");
                    event
                }
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run(Arc::clone(&self.callbacks), rx));
        // Fails only if the runtime is already shutting down
        let _ = tx.send(event);
        *queue = Some(tx);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("running", &self.queue.lock().is_some())
            .finish_non_exhaustive()
    }
}

async fn run(callbacks: Arc<RwLock<Callbacks>>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        deliver(&callbacks, event);
    }
    debug!("Event notifier stopped");
}

fn deliver(callbacks: &RwLock<Callbacks>, event: Event) {
    // Clone the slot out so the callback runs without the lock held
    let outcome = match &event {
        Event::Connected => {
            let Some(callback) = callbacks.read().on_connect.clone() else {
                return;
            };
            catch_unwind(AssertUnwindSafe(|| callback()))
        }
        Event::Disconnected(reason) => {
            let Some(callback) = callbacks.read().on_disconnect.clone() else {
                return;
            };
            catch_unwind(AssertUnwindSafe(|| callback(reason)))
        }
        Event::Error(err) => {
            let Some(callback) = callbacks.read().on_error.clone() else {
                return;
            };
            catch_unwind(AssertUnwindSafe(|| callback(err)))
        }
    };

    if outcome.is_err() {
        error!("Event callback panicked while handling {:?}", event);
    }
}
