//! Callback dispatch: a single-consumer queue of decoded events.
//!
//! One dispatcher per client. The connection's receive path posts events
//! without blocking; the application drains them cooperatively with
//! [`CallbackDispatcher::run_once`] or [`CallbackDispatcher::run`].
//! Events reach subscribers strictly in arrival order; a panicking
//! handler does not stop delivery of that event to later handlers, but
//! the failure is surfaced to the drain caller afterwards.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::envelope::{MessageEnvelope, ResultCode};
use crate::error::{CmError, Result};

/// Decoded event delivered to application code.
#[derive(Debug, Clone)]
pub enum CmEvent {
    /// Handshake finished; `result` is OK on success and carries the
    /// failure code otherwise (including exhaustion of all servers)
    Connected(ConnectedEvent),
    /// Session ended; distinguishes caller-initiated disconnects
    Disconnected(DisconnectedEvent),
    /// Any inbound message envelope, job-correlated or not
    Message(MessageEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub result: ResultCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub user_initiated: bool,
}

/// Event types for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    Connected,
    Disconnected,
    Message,
}

impl CmEvent {
    pub fn kind(&self) -> CmEventKind {
        match self {
            CmEvent::Connected(_) => CmEventKind::Connected,
            CmEvent::Disconnected(_) => CmEventKind::Disconnected,
            CmEvent::Message(_) => CmEventKind::Message,
        }
    }
}

/// Registered interest in one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    kind: CmEventKind,
}

type Handler = Box<dyn Fn(&CmEvent) + Send + Sync + 'static>;

struct DispatcherInner {
    tx: mpsc::UnboundedSender<CmEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<CmEvent>>,
    subscribers: RwLock<HashMap<CmEventKind, Vec<(u64, Handler)>>>,
    next_handle: AtomicU64,
}

/// Per-client event queue with type-based subscription.
#[derive(Clone)]
pub struct CallbackDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(DispatcherInner {
                tx,
                rx: Mutex::new(rx),
                subscribers: RwLock::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for one event type.
    pub fn subscribe<F>(&self, kind: CmEventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&CmEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned");
        subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        SubscriptionHandle { id, kind }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned");
        if let Some(handlers) = subscribers.get_mut(&handle.kind) {
            handlers.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Drop every subscription. Part of client teardown.
    pub fn clear_subscriptions(&self) {
        self.inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .clear();
    }

    /// Enqueue an event from the receive path. Never blocks.
    pub fn post_event(&self, event: CmEvent) {
        if self.inner.tx.send(event).is_err() {
            debug!("event dropped: dispatcher queue closed");
        }
    }

    /// Drain the queue once.
    ///
    /// Waits up to `timeout` for at least one event, then delivers
    /// everything already queued, in arrival order. Returns the number of
    /// events delivered.
    ///
    /// # Errors
    /// `CmError::CallbackPanic` if a handler panicked; delivery of that
    /// event to its remaining handlers finished first, and undelivered
    /// events stay queued for the next drain.
    pub async fn run_once(&self, timeout: Duration) -> Result<usize> {
        let mut rx = self.inner.rx.lock().await;

        let first = match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => return Ok(0),
            Ok(None) => return Ok(0),
            Ok(Some(event)) => event,
        };

        let mut delivered = 1;
        self.deliver(&first)?;

        while let Ok(event) = rx.try_recv() {
            self.deliver(&event)?;
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Drain events until the token is cancelled.
    ///
    /// # Errors
    /// Propagates the first handler panic, leaving the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.run_once(Duration::from_millis(250)) => {
                    result?;
                }
            }
        }
    }

    fn deliver(&self, event: &CmEvent) -> Result<()> {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .expect("subscriber lock poisoned");

        let mut panic_message = None;
        if let Some(handlers) = subscribers.get(&event.kind()) {
            for (id, handler) in handlers {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    warn!(subscription = id, %message, "callback handler panicked");
                    // Keep delivering to the remaining handlers
                    panic_message.get_or_insert(message);
                }
            }
        }

        match panic_message {
            Some(message) => Err(CmError::CallbackPanic(message)),
            None => Ok(()),
        }
    }
}
