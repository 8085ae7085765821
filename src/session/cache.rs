//! Bounded cache of formed sessions.
//!
//! Lookups promote the entry under a brief write lock, so capacity
//! eviction drops the least recently used session. Misses are coalesced per
//! header: formation runs at most once and every concurrent caller observes
//! the same `Arc<Session>`.

use super::{Session, SessionHeader};
use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default cache capacity.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Cache of sessions keyed by header.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<RwLock<LruCache<SessionHeader, Arc<Session>>>>,
    pending: Arc<Mutex<HashMap<SessionHeader, Arc<Mutex<()>>>>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    additions: AtomicU64,
    evictions: AtomicU64,
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of sessions formed and added.
    pub additions: u64,
    /// Number of sessions evicted as stale.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl SessionCache {
    /// Create a new cache with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(RwLock::new(LruCache::new(cap))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Look up a session without forming it.
    ///
    /// Used for historical reads (challenge adjudication) that must not
    /// populate the cache.
    #[must_use]
    pub fn get(&self, header: &SessionHeader) -> Option<Arc<Session>> {
        let found = self.inner.write().get(header).cloned();
        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Return the cached session for `header`, forming it with `form` on a miss.
    ///
    /// Concurrent callers for the same header wait for the first formation
    /// and share its result. A failed formation caches nothing.
    ///
    /// # Errors
    ///
    /// Propagates the formation error, or [`Error::Internal`] if `form`
    /// returns a session for a different header.
    pub fn get_or_form<F>(&self, header: &SessionHeader, form: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Result<Session>,
    {
        if let Some(session) = self.get(header) {
            return Ok(session);
        }

        let slot = Arc::clone(self.pending.lock().entry(header.clone()).or_default());
        let result = {
            let _guard = slot.lock();
            // Another caller may have formed it while we waited. The read
            // guard must be released before formation takes the write lock.
            let cached = self.inner.read().peek(header).cloned();
            match cached {
                Some(session) => Ok(session),
                None => self.form_and_insert(header, form),
            }
        };

        let mut pending = self.pending.lock();
        // Two references means only the map and this caller hold the slot.
        if Arc::strong_count(&slot) <= 2 {
            pending.remove(header);
        }
        result
    }

    fn form_and_insert<F>(&self, header: &SessionHeader, form: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Result<Session>,
    {
        let session = form()?;
        if &session.header != header {
            return Err(Error::Internal(format!(
                "session formed for height {} cached under height {}",
                session.header.session_block_height, header.session_block_height
            )));
        }

        let session = Arc::new(session);
        self.inner.write().put(header.clone(), Arc::clone(&session));
        self.counters.additions.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Drop every session that started before `min_height`.
    ///
    /// Returns the number of sessions evicted.
    pub fn evict_before(&self, min_height: u64) -> usize {
        let mut cache = self.inner.write();
        let stale: Vec<SessionHeader> = cache
            .iter()
            .filter(|(header, _)| header.session_block_height < min_height)
            .map(|(header, _)| header.clone())
            .collect();
        for header in &stale {
            cache.pop(header);
        }

        if !stale.is_empty() {
            self.counters
                .evictions
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            debug!(
                "Evicted {} session(s) older than height {}",
                stale.len(),
                min_height
            );
        }
        stale.len()
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            additions: self.counters.additions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Get the current number of sessions in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Clear all sessions from the cache.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
