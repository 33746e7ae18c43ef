//! Tracking of live client connections, for shutdown only.
//!
//! Every connection registers on accept and unregisters when its servicing
//! task ends. Graceful shutdown tells every live connection to stop reading
//! and then waits for the set to drain; the request path never touches this
//! registry beyond those two calls.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};

/// The maximum number of simultaneously connected clients.
pub const MAX_CLIENTS: usize = 4096;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("connection table is full")]
    Full,
    #[error("server is shutting down")]
    Draining,
}

#[derive(Debug)]
struct Inner {
    live: usize,
    next_id: u64,
    draining: bool,
}

/// Handle given to a registered connection: an id for logging and the
/// shutdown signal its servicing task must select on while reading.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    became_empty: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                live: 0,
                next_id: 0,
                draining: false,
            }),
            became_empty: Notify::new(),
            shutdown_tx,
        }
    }

    /// Register a newly accepted connection.
    pub fn register(&self) -> Result<ClientHandle, RegisterError> {
        let mut inner = self.inner.lock();
        if inner.draining {
            return Err(RegisterError::Draining);
        }
        if inner.live >= MAX_CLIENTS {
            return Err(RegisterError::Full);
        }
        inner.live += 1;
        let id = inner.next_id;
        inner.next_id += 1;
        Ok(ClientHandle {
            id,
            shutdown: self.shutdown_tx.subscribe(),
        })
    }

    /// Remove a connection from the live set, waking any shutdown waiter
    /// when the set becomes empty.
    pub fn unregister(&self, handle: ClientHandle) {
        let mut inner = self.inner.lock();
        inner.live -= 1;
        tracing::trace!(id = handle.id, live = inner.live, "connection unregistered");
        if inner.live == 0 {
            self.became_empty.notify_waiters();
        }
    }

    /// Tell every live connection to stop reading. Registration of new
    /// connections is refused from this point on.
    pub fn shutdown_all(&self) {
        self.inner.lock().draining = true;
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until no live connections remain. Resolves immediately when the
    /// set is already empty.
    pub async fn wait_for_empty(&self) {
        loop {
            let became_empty = self.became_empty.notified();
            if self.inner.lock().live == 0 {
                return;
            }
            became_empty.await;
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
