//! Signal handling.
//!
//! This module provides a [`Signals`] type the server uses to learn about
//! the shutdown request (SIGHUP on the host OS). Keeping it behind a small
//! abstraction makes graceful shutdown triggerable from tests without
//! delivering real signals.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;

/// A signal source.
#[derive(Debug, Clone)]
enum SignalSource {
    /// use tokio's signal handling.
    Tokio,
    /// never fires; for tests that shut the server down by other means.
    Never,
    /// fires when the paired [`Notify`] is notified; for tests.
    Trigger(Arc<Notify>),
}

/// An abstraction for signal handling.
#[derive(Debug, Clone)]
pub struct Signals {
    /// SIGHUP signal source.
    hangup: SignalSource,
}

impl Signals {
    /// Returns a future that resolves when a shutdown is requested.
    #[must_use]
    pub fn hangup(&self) -> impl Future<Output = Result<(), ()>> + 'static {
        let source = self.hangup.clone();
        async move {
            match source {
                SignalSource::Tokio => {
                    let mut signal =
                        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                            .expect("failed to register signal handler");
                    match signal.recv().await {
                        Some(()) => Ok(()),
                        None => Err(()),
                    }
                }
                SignalSource::Never => std::future::pending().await,
                SignalSource::Trigger(notify) => {
                    notify.notified().await;
                    Ok(())
                }
            }
        }
    }

    /// A [`Signals`] that never requests shutdown.
    pub fn never() -> Self {
        Self {
            hangup: SignalSource::Never,
        }
    }

    /// A [`Signals`] paired with a handle that requests shutdown when
    /// notified.
    pub fn trigger() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            Self {
                hangup: SignalSource::Trigger(Arc::clone(&notify)),
            },
            notify,
        )
    }
}

/// Returns a [`Signals`] instance that uses the host OS's signal handling.
pub fn from_host_os() -> Signals {
    Signals {
        hangup: SignalSource::Tokio,
    }
}
