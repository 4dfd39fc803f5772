//! Request-coalescing TTL cache for client-side data fetches.
//!
//! `get_or_fetch` serves a fresh cached value when one exists; otherwise it
//! dispatches the caller's fetch function with singleflight deduplication per
//! key, a minimum interval between dispatches per key, and a global cap on
//! concurrently executing fetches.
//!
//! Fetch failures never escape: an error, a panic or a timeout in the fetch
//! function degrades to the last cached value (if any) or [`Lookup::NoData`].
//! Callers distinguish the outcomes through the returned [`Lookup`] and the
//! counters in [`CoalescerStats`], never through an error type.
//!
//! All three per-key maps are `DashMap`s, so unrelated keys never contend on
//! a single lock.

use crate::cache::entry::CacheEntry;
use crate::utils::fmt_duration;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Tuning knobs shared by every key in one coalescer.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Minimum spacing between two dispatched fetches for the same key.
    pub min_interval: Duration,
    /// Maximum number of fetch functions executing at once, across all keys.
    pub max_concurrent: usize,
    /// Deadline applied to a fetch when the caller doesn't pass one.
    pub default_timeout: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_concurrent: 4,
            default_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-call options for [`RequestCoalescer::get_or_fetch`].
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub ttl: Duration,
    pub force_refresh: bool,
    /// Overrides [`CoalescerConfig::default_timeout`].
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            force_refresh: false,
            timeout: None,
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum Lookup<T> {
    /// A value within its TTL, either already cached or fetched by this call.
    Hit(Arc<T>),
    /// An expired value, served because a fresh one could not be obtained
    /// right now (throttled, another fetch in flight, or the fetch failed).
    StaleFallback(Arc<T>),
    /// Nothing cached and nothing fetched. Try again later.
    NoData,
}

impl<T> Lookup<T> {
    /// Collapse into the plain "value or nothing" shape.
    pub fn into_option(self) -> Option<Arc<T>> {
        match self {
            Lookup::Hit(value) | Lookup::StaleFallback(value) => Some(value),
            Lookup::NoData => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Lookup::Hit(value) | Lookup::StaleFallback(value) => Some(value),
            Lookup::NoData => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::StaleFallback(_))
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Lookup::NoData)
    }
}

impl<T> Clone for Lookup<T> {
    fn clone(&self) -> Self {
        match self {
            Lookup::Hit(value) => Lookup::Hit(Arc::clone(value)),
            Lookup::StaleFallback(value) => Lookup::StaleFallback(Arc::clone(value)),
            Lookup::NoData => Lookup::NoData,
        }
    }
}

/// Point-in-time copy of the coalescer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescerStats {
    pub hits: u64,
    pub stale_fallbacks: u64,
    pub no_data: u64,
    pub dispatched: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub throttled: u64,
    /// Calls that joined another caller's fetch. These are not also counted
    /// as hits, stale fallbacks or no-data.
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_fallbacks: AtomicU64,
    no_data: AtomicU64,
    dispatched: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    throttled: AtomicU64,
    coalesced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoalescerStats {
        CoalescerStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_fallbacks: self.stale_fallbacks.load(Ordering::Relaxed),
            no_data: self.no_data.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Why a dispatched fetch produced no value.
enum FetchFailure {
    Error(String),
    Panicked,
    TimedOut(Duration),
}

/// Shared request coalescer. Clone-cheap (all `Arc`-wrapped internals);
/// independent instances share nothing.
#[derive(Clone)]
pub struct RequestCoalescer {
    /// key → cached value and expiry
    entries: Arc<DashMap<String, CacheEntry>>,
    /// key → singleflight lock, created lazily
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// key → when the last fetch was dispatched
    last_request: Arc<DashMap<String, Instant>>,
    /// Bounds concurrently executing fetches across all keys.
    throttle: Arc<Semaphore>,
    config: Arc<CoalescerConfig>,
    counters: Arc<Counters>,
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::new(CoalescerConfig::default())
    }
}

impl RequestCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        let capacity = config.max_concurrent.max(1);
        Self {
            entries: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            last_request: Arc::new(DashMap::new()),
            throttle: Arc::new(Semaphore::new(capacity)),
            config: Arc::new(config),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    pub fn stats(&self) -> CoalescerStats {
        self.counters.snapshot()
    }

    /// Return the value cached under `key`, fetching it with `fetch` when
    /// there is no fresh value.
    ///
    /// Concurrent callers for the same key share one dispatch: whoever wins
    /// the key's lock runs `fetch`, the others get the current (possibly
    /// stale) value or, if nothing is cached, wait for the winner and re-read.
    pub async fn get_or_fetch<T, F, Fut, E>(
        &self,
        key: &str,
        options: FetchOptions,
        fetch: F,
    ) -> Lookup<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !options.force_refresh
            && let Some(value) = self.fresh::<T>(key)
        {
            trace!(key, "cache hit");
            Counters::bump(&self.counters.hits);
            return Lookup::Hit(value);
        }

        let lock = self
            .locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return self.join_in_flight::<T>(key, &lock).await,
        };

        // Another caller may have finished a fetch between our first read and
        // taking the lock.
        if !options.force_refresh
            && let Some(value) = self.fresh::<T>(key)
        {
            trace!(key, "cache hit after lock");
            Counters::bump(&self.counters.hits);
            return Lookup::Hit(value);
        }

        if let Some(wait) = self.throttled_for(key) {
            debug!(
                key,
                retry_in = fmt_duration(wait),
                "fetch throttled, serving cached value"
            );
            Counters::bump(&self.counters.throttled);
            return self.existing::<T>(key);
        }

        let Ok(_permit) = self.throttle.acquire().await else {
            // The semaphore is never closed.
            return self.existing::<T>(key);
        };

        self.last_request.insert(key.to_owned(), Instant::now());
        Counters::bump(&self.counters.dispatched);

        let deadline = options.timeout.unwrap_or(self.config.default_timeout);
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            deadline,
            AssertUnwindSafe(async move { fetch().await }).catch_unwind(),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Ok(value))) => {
                let value = Arc::new(value);
                self.entries.insert(
                    key.to_owned(),
                    CacheEntry::new(Arc::clone(&value), Instant::now() + options.ttl),
                );
                debug!(key, duration = fmt_duration(start.elapsed()), "fetched and cached");
                return Lookup::Hit(value);
            }
            Ok(Ok(Err(e))) => FetchFailure::Error(e.to_string()),
            Ok(Err(_panic)) => FetchFailure::Panicked,
            Err(_elapsed) => FetchFailure::TimedOut(deadline),
        };

        match failure {
            FetchFailure::Error(message) => {
                Counters::bump(&self.counters.failures);
                warn!(key, error = %message, "fetch failed");
            }
            FetchFailure::Panicked => {
                Counters::bump(&self.counters.failures);
                error!(key, "fetch panicked");
            }
            FetchFailure::TimedOut(after) => {
                Counters::bump(&self.counters.timeouts);
                warn!(key, timeout = fmt_duration(after), "fetch timed out");
            }
        }

        self.existing::<T>(key)
    }

    /// Remove every cached entry whose key starts with `prefix`, along with
    /// its rate window, so the next lookup dispatches immediately. Fetches
    /// already in flight still store their result. Returns the number of
    /// entries removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        self.last_request.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        debug!(prefix, removed, "cache invalidated");
        removed
    }

    /// Drop all entries and rate windows. Locks are kept; they are idle.
    pub fn clear(&self) {
        self.entries.clear();
        self.last_request.clear();
        debug!("cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of per-key locks currently allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Evict per-key locks nobody holds, whose key has no cached entry and
    /// no dispatch within `idle` (nor within the rate window). Returns the
    /// number of locks evicted.
    pub fn prune_idle_locks(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let horizon = idle.max(self.config.min_interval);
        let before = self.locks.len();

        self.locks.retain(|key, lock| {
            // The map's own reference is the only one: nobody is fetching or waiting.
            if Arc::strong_count(lock) > 1 {
                return true;
            }
            if self.entries.contains_key(key) {
                return true;
            }
            let last = self.last_request.get(key).map(|at| *at);
            match last {
                Some(at) if now.saturating_duration_since(at) < horizon => true,
                Some(_) => {
                    self.last_request.remove(key);
                    false
                }
                None => false,
            }
        });

        let evicted = before.saturating_sub(self.locks.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.locks.len(), "idle cache locks evicted");
        }
        evicted
    }

    /// Spawn a background task that prunes idle locks every `interval` until
    /// `cancel` fires.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("cache maintenance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.prune_idle_locks(idle);
                    }
                }
            }
        })
    }

    /// Another caller holds the key's lock. Serve whatever is cached, or wait
    /// for the in-flight fetch and re-read. Counted only as `coalesced`.
    async fn join_in_flight<T: Send + Sync + 'static>(
        &self,
        key: &str,
        lock: &Arc<Mutex<()>>,
    ) -> Lookup<T> {
        Counters::bump(&self.counters.coalesced);

        let lookup = self.cached::<T>(key);
        if !lookup.is_no_data() {
            trace!(key, "fetch in flight, serving cached value");
            return lookup;
        }

        debug!(key, "waiting for in-flight fetch");
        drop(lock.lock().await);
        self.cached::<T>(key)
    }

    /// How much longer `key` must wait before another dispatch, if any.
    fn throttled_for(&self, key: &str) -> Option<Duration> {
        let last = *self.last_request.get(key)?;
        let elapsed = Instant::now().saturating_duration_since(last);
        (elapsed < self.config.min_interval).then(|| self.config.min_interval - elapsed)
    }

    /// The cached value for `key` if it holds a `T` within its TTL.
    fn fresh<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.get(key)?;
        if entry.is_stale(Instant::now()) {
            return None;
        }
        self.downcast(key, &entry)
    }

    /// Whatever is cached for `key`, classified by freshness.
    fn cached<T: Send + Sync + 'static>(&self, key: &str) -> Lookup<T> {
        let cached = self.entries.get(key).and_then(|entry| {
            let stale = entry.is_stale(Instant::now());
            self.downcast::<T>(key, &entry).map(|value| (value, stale))
        });

        match cached {
            Some((value, false)) => Lookup::Hit(value),
            Some((value, true)) => Lookup::StaleFallback(value),
            None => Lookup::NoData,
        }
    }

    /// [`Self::cached`], recording the outcome in the counters.
    fn existing<T: Send + Sync + 'static>(&self, key: &str) -> Lookup<T> {
        let lookup = self.cached::<T>(key);
        let counter = match &lookup {
            Lookup::Hit(_) => &self.counters.hits,
            Lookup::StaleFallback(_) => &self.counters.stale_fallbacks,
            Lookup::NoData => &self.counters.no_data,
        };
        Counters::bump(counter);
        lookup
    }

    fn downcast<T: Send + Sync + 'static>(&self, key: &str, entry: &CacheEntry) -> Option<Arc<T>> {
        let value = entry.value::<T>();
        if value.is_none() {
            warn!(
                key,
                expected = std::any::type_name::<T>(),
                "cached value has a different type, treating as a miss"
            );
        }
        value
    }
}
