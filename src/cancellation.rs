//! Cooperative cancellation for batch runs.
//!
//! One token is shared by the signal handler and every fixture task. A fixture
//! that observes cancellation stops executing directives but still releases
//! its backend before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Token for cooperative cancellation of fixture runs.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    sender: broadcast::Sender<()>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                sender,
            }),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel every run holding a clone of this token.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancellation requested");
            // Ignore error if no receivers
            let _ = self.inner.sender.send(());
        }
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Resolves immediately if the token was cancelled before the call.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.sender.subscribe();
        if self.is_cancelled() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
