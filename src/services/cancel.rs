//! A small cooperative cancellation signal, analogous to an AbortSignal.
//!
//! `EndpointQueue`/`AudioQueue` hand one of these to every `execute` closure;
//! `cancel_song` flips it and wakes any task awaiting `cancelled()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelSignal {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves as soon as `abort()` is called. An `execute` closure should
    /// race this against its own I/O to return within one network boundary
    /// of a cancellation, per §5.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
