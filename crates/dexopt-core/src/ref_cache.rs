//! Reference-counted, debounced cache of the artd connection
//!
//! Callers that make one or more artd calls hold an [`ArtdPin`] for the duration of the
//! work. While any pin is alive the cached connection stays; once the last pin is dropped,
//! eviction is scheduled after a keep-alive delay so that bursts of short operations reuse
//! one connection. A lost connection clears the cache immediately and the next caller
//! reconnects.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::debouncer::Debouncer;
use crate::error::{ArtdError, ArtdResult};
use crate::store::ArtifactStore;

/// How long an unpinned connection is kept before being dropped
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Opens connections to artd
pub trait ArtdConnector: Send + Sync {
    /// Establish a new connection
    fn connect(&self) -> ArtdResult<Arc<dyn ArtifactStore>>;
}

struct CacheState {
    store: Option<Arc<dyn ArtifactStore>>,
    pins: usize,
}

/// The connection cache
pub struct ArtdRefCache {
    connector: Arc<dyn ArtdConnector>,
    state: Mutex<CacheState>,
    evictor: Debouncer,
    keep_alive: Duration,
    weak_self: Weak<ArtdRefCache>,
}

impl ArtdRefCache {
    /// Create an empty cache
    pub fn new(connector: Arc<dyn ArtdConnector>, keep_alive: Duration) -> std::io::Result<Arc<Self>> {
        let evictor = Debouncer::new("artd-ref-cache")?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            connector,
            state: Mutex::new(CacheState {
                store: None,
                pins: 0,
            }),
            evictor,
            keep_alive,
            weak_self: weak_self.clone(),
        }))
    }

    /// The cached connection, connecting if needed.
    ///
    /// Without a pin the connection may be evicted right after the keep-alive delay.
    pub fn artd(&self) -> ArtdResult<Arc<dyn ArtifactStore>> {
        let mut state = self.state.lock();
        if let Some(store) = &state.store {
            return Ok(Arc::clone(store));
        }

        let store = self.connector.connect()?;
        state.store = Some(Arc::clone(&store));
        if state.pins == 0 {
            self.schedule_eviction();
        }
        Ok(store)
    }

    /// Keep the connection cached until the returned guard is dropped
    pub fn pin(&self) -> ArtdPin {
        let mut state = self.state.lock();
        state.pins += 1;
        if state.pins == 1 {
            self.evictor.cancel();
        }
        ArtdPin {
            cache: self.weak_self.clone(),
        }
    }

    /// Drop the cached connection because the remote end died
    pub fn notify_connection_lost(&self) {
        let mut state = self.state.lock();
        if state.store.take().is_some() {
            log::warn!("artd connection lost, clearing cached reference");
        }
    }

    /// Drop the cached connection if `err` says artd died. Other errors leave it alone.
    pub fn notify_error(&self, err: &ArtdError) {
        if matches!(err, ArtdError::DeadObject(_)) {
            self.notify_connection_lost();
        }
    }

    /// Whether a connection is currently cached
    pub fn is_cached(&self) -> bool {
        self.state.lock().store.is_some()
    }

    /// Number of live pins
    pub fn pin_count(&self) -> usize {
        self.state.lock().pins
    }

    fn unpin(&self) {
        let mut state = self.state.lock();
        state.pins = state.pins.saturating_sub(1);
        if state.pins == 0 && state.store.is_some() {
            self.schedule_eviction();
        }
    }

    fn schedule_eviction(&self) {
        let cache = self.weak_self.clone();
        self.evictor.post(self.keep_alive, move || {
            if let Some(cache) = cache.upgrade() {
                cache.evict_if_unpinned();
            }
        });
    }

    fn evict_if_unpinned(&self) {
        let mut state = self.state.lock();
        if state.pins == 0 {
            state.store = None;
        }
    }
}

/// Scoped guard returned by [`ArtdRefCache::pin`]
#[must_use = "the connection is only pinned while the guard is alive"]
pub struct ArtdPin {
    cache: Weak<ArtdRefCache>,
}

impl Drop for ArtdPin {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.unpin();
        }
    }
}
