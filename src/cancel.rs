//! Cooperative cancellation
//!
//! Tool calls receive a token and are expected to observe it; the engine
//! stops waiting at the deadline either way.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// A token for cooperative cancellation of in-flight tool calls
///
/// Clones share state; cancelling one cancels all. Child tokens are
/// cancelled with their parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

struct CancelTokenInner {
    cancelled: RwLock<bool>,
    notify: Notify,
    children: RwLock<Vec<CancelToken>>,
}

impl CancelToken {
    /// Create a new token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Create a child cancelled together with this token
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.write().push(child.clone());
        }
        child
    }

    /// Cancel this token and all children
    pub fn cancel(&self) {
        {
            let mut cancelled = self.inner.cancelled.write();
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.inner.notify.notify_waiters();
        for child in self.inner.children.read().iter() {
            child.cancel();
        }
    }

    /// Whether the token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.read()
    }

    /// Wait until the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
