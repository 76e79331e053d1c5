//! Trailing-edge debouncer
//!
//! A dedicated thread waits on a condvar for the deadline of the single pending action.
//! Posting a new action replaces the pending one and restarts the delay, so a burst of
//! posts runs only the last action, once, after the burst has been quiet for the delay.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Action = Box<dyn FnOnce() + Send>;

struct Pending {
    run_at: Instant,
    action: Action,
}

struct Shared {
    pending: Mutex<Option<Pending>>,
    notify: Condvar,
    shutdown: AtomicBool,
}

/// Runs at most one delayed action at a time on a background thread
pub struct Debouncer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Start a debouncer thread with the given name
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(&worker))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `action` after `delay`, replacing any pending action
    pub fn post<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.shared.pending.lock();
        *pending = Some(Pending {
            run_at: Instant::now() + delay,
            action: Box::new(action),
        });
        self.shared.notify.notify_one();
    }

    /// Drop the pending action without running it. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let taken = self.shared.pending.lock().take();
        taken.is_some()
    }

    /// Run the pending action now on the calling thread. Returns whether one was pending.
    pub fn flush(&self) -> bool {
        let taken = self.shared.pending.lock().take();
        match taken {
            Some(pending) => {
                (pending.action)();
                true
            }
            None => false,
        }
    }

    /// Whether an action is waiting for its deadline
    pub fn has_pending(&self) -> bool {
        self.shared.pending.lock().is_some()
    }

    /// Stop the thread. The pending action, if any, is discarded.
    pub fn stop(&self) {
        {
            let mut pending = self.shared.pending.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            pending.take();
            self.shared.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            // An action that drops the last owner runs on the debouncer thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: &Shared) {
    let mut pending = shared.pending.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let run_at = pending.as_ref().map(|p| p.run_at);
        match run_at {
            None => shared.notify.wait(&mut pending),
            Some(run_at) if run_at <= Instant::now() => {
                if let Some(due) = pending.take() {
                    drop(pending);
                    (due.action)();
                    pending = shared.pending.lock();
                }
            }
            Some(run_at) => {
                shared.notify.wait_until(&mut pending, run_at);
            }
        }
    }
}
