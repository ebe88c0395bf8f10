//! Typed publish/subscribe with per-subscriber failure isolation.
//!
//! Every component publishes a closed event enum through an [`EventBus`].
//! Delivery is synchronous and in subscription order: `publish` returns
//! only after every handler has run, which is what lets the orchestrator
//! guarantee that a terminal event is observed before the session's files
//! are removed.
//!
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers still run and the publisher never sees the failure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, warn};

use crate::Result;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
pub type SubscriptionId = u64;

type Handler<E> = Arc<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Synchronous, failure-isolated event fan-out.
pub struct EventBus<E> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> EventBus<E> {
    /// Create an empty bus. `name` only labels diagnostics.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler; it receives every event published afterwards.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        guard.len() != before
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every handler and return how many succeeded.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe from inside a callback without deadlocking.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(bus = self.name, subscription = id, %err, "event subscriber failed");
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_owned());
                    error!(bus = self.name, subscription = id, panic = %message, "event subscriber panicked");
                }
            }
        }
        delivered
    }
}
