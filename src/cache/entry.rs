//! A single cached payload and its expiry.

use std::any::Any;
use std::sync::Arc;
use tokio::time::Instant;

/// Type-erased payload. Each key is free to hold its own response type.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// One cached response. Replaced wholesale on every successful fetch, never mutated.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: Payload,
    expires_at: Instant,
}

impl CacheEntry {
    pub(crate) fn new<T: Send + Sync + 'static>(value: Arc<T>, expires_at: Instant) -> Self {
        Self { value, expires_at }
    }

    /// An entry is stale once `now` is strictly past its expiry.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Downcast the payload, or `None` if the key holds a different type.
    pub(crate) fn value<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
