//! Correlation of responses to pending requests.
//!
//! Each request registers a one-shot slot under its id before it is
//! written. The job's event pump hands every inbound message to
//! [`Multiplexer::resolve`], which fulfils the slot with the same id and
//! removes it. Responses may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mapepire_protocol::response_id;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct Multiplexer {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    timeout: Option<Duration>,
}

impl Multiplexer {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a slot for `id`.
    pub(crate) fn register(self: &Arc<Self>, id: &str) -> Waiter {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id.to_string(), tx).is_some() {
            tracing::warn!(id = %id, "correlation id reused; earlier waiter abandoned");
        }
        Waiter {
            id: id.to_string(),
            rx,
            mux: Arc::clone(self),
        }
    }

    /// Route an inbound message to its waiter. Returns whether one was found.
    pub(crate) fn resolve(&self, message: Value) -> bool {
        let Some(id) = response_id(&message).map(str::to_string) else {
            tracing::warn!("dropping message without correlation id");
            return false;
        };

        let Some(tx) = self.pending.lock().remove(&id) else {
            tracing::warn!(id = %id, "no pending request for response");
            return false;
        };

        // the waiter may have been dropped in the meantime
        tx.send(message).is_ok()
    }

    /// Number of unresolved requests.
    pub(crate) fn running_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending slot; their waiters fail with
    /// [`Error::ConnectionClosed`].
    pub(crate) fn abandon_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "abandoning pending requests");
        }
        drained.len()
    }
}

/// The receiving half of a registered slot.
///
/// Dropping an unresolved waiter removes its slot.
#[derive(Debug)]
pub(crate) struct Waiter {
    id: String,
    rx: oneshot::Receiver<Value>,
    mux: Arc<Multiplexer>,
}

impl Waiter {
    pub(crate) async fn wait(mut self) -> Result<Value> {
        let received = match self.mux.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(Error::Timeout {
                        id: self.id.clone(),
                        timeout,
                    });
                }
            },
            None => (&mut self.rx).await,
        };

        received.map_err(|_| Error::ConnectionClosed(self.id.clone()))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.mux.pending.lock().remove(&self.id);
    }
}
