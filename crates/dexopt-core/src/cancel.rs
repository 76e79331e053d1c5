//! Caller-side cancellation token

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Listener = Box<dyn FnOnce() + Send>;

/// A cancellation token handed to long-running operations.
///
/// Cloning shares the token. Work in progress observes cancellation by polling
/// [`is_canceled`](Self::is_canceled) or by registering a listener, which is how a running
/// compile gets its artd-side token cancelled.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    canceled: AtomicBool,
    listener: Mutex<Option<Listener>>,
}

impl CancellationSignal {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. The current listener, if any, runs once on the calling thread.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Replace the listener. If already cancelled, `listener` runs immediately.
    pub fn set_on_cancel_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.listener.lock();
        if self.is_canceled() {
            drop(slot);
            listener();
            return;
        }
        *slot = Some(Box::new(listener));
    }

    /// Drop the listener without running it
    pub fn clear_on_cancel_listener(&self) {
        self.inner.listener.lock().take();
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
