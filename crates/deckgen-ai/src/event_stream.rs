use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::error::LlmError;
use crate::types::{RawEvent, RawResponse};

/// A lazy, finite, forward-only event sequence with a final result.
///
/// Producers `push` events and then `end` exactly once with the final
/// result; consumers drain events with `next` (which returns `None` once the
/// stream has ended and the buffer is drained) and can await the final
/// result with `result`. Not restartable.
pub struct EventStream<T, R> {
    inner: Arc<StreamInner<T, R>>,
}

struct StreamInner<T, R> {
    sender: mpsc::UnboundedSender<T>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    final_result: Mutex<Option<R>>,
    event_notify: Notify,
    final_notify: Notify,
    done: AtomicBool,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> Default for EventStream<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> EventStream<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StreamInner {
                sender,
                receiver: AsyncMutex::new(receiver),
                final_result: Mutex::new(None),
                event_notify: Notify::new(),
                final_notify: Notify::new(),
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Ignored after `end` has been called.
    pub fn push(&self, event: T) {
        if self.inner.done.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.sender.send(event);
        self.inner.event_notify.notify_waiters();
    }

    /// Marks the stream finished. Buffered events are still delivered to
    /// `next` before it starts returning `None`.
    pub fn end(&self, result: Option<R>) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(result) = result {
            let mut guard = self
                .inner
                .final_result
                .lock()
                .expect("final_result mutex poisoned");
            if guard.is_none() {
                *guard = Some(result);
            }
        }
        self.inner.event_notify.notify_waiters();
        self.inner.final_notify.notify_waiters();
    }

    pub async fn next(&self) -> Option<T> {
        loop {
            // Register the waiter before checking state so a notification
            // that lands between the check and the await still wakes us.
            let notified = self.inner.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut receiver = self.inner.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if self.inner.done.load(Ordering::SeqCst) {
                            return None;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    /// Waits for the stream to end and returns its final result, or `None`
    /// if the producer ended the stream without one.
    pub async fn result(&self) -> Option<R> {
        loop {
            let notified = self.inner.final_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self
                .inner
                .final_result
                .lock()
                .expect("final_result mutex poisoned")
                .clone()
            {
                return Some(result);
            }

            if self.inner.done.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }
}

/// Raw provider events; the final result is the aggregated response a
/// non-streaming call over the same content would have produced.
pub type RawEventStream = EventStream<RawEvent, Result<RawResponse, LlmError>>;
