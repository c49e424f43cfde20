//! Shutdown signaling.
//!
//! A [`ShutdownSignal`] is raised at most once, either by the idle timer or
//! by the `quit` method, and observed by [`Service::run`](crate::Service::run).

use std::sync::Arc;
use tokio::sync::watch;

/// Why a service stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The idle timer fired with no live activities.
    Idle,

    /// The `quit` method was called.
    Quit,
}

/// One-shot, cloneable shutdown trigger.
///
/// The first [`trigger`](ShutdownSignal::trigger) wins; later calls are
/// ignored so the reported reason never changes.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Returns false if it was already raised.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// The reason, once raised.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    /// Wait until the signal is raised.
    pub async fn wait(&self) -> ShutdownReason {
        // ---
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // The sender lives in `self`, so this cannot fail while we wait
            if rx.changed().await.is_err() {
                return ShutdownReason::Quit;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
