use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Caller-side cancellation handle. The signal is propagated to the
/// in-flight provider round-trip and the event loop; no further tool calls
/// run once it fires.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        // Register the waiter before re-checking the flag so an abort that
        // lands in between still wakes us.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(AbortInner {
                    aborted: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.inner.aborted.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
