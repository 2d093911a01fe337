//! Rendered PAC cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// How long a rendered PAC body stays valid.
pub const PAC_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

struct CacheEntry {
    body: Arc<str>,
    expires_at: Instant,
}

/// TTL-based cache of rendered PAC bodies keyed by request path.
///
/// Bodies are stored before the per-request host rewrite, so one entry
/// serves every client regardless of how it reached the server.
pub struct PacCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    /// Bumped by every `clear_all`, under the write lock.
    generation: AtomicU64,
}

impl PacCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current invalidation generation. Read it before rendering and pass it
    /// to [`PacCache::set_if_current`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up an unexpired body. Expired entries are evicted on the way out.
    pub fn get(&self, path: &str) -> Option<Arc<str>> {
        let now = Instant::now();

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(path) {
                Some(entry) if now < entry.expires_at => return Some(Arc::clone(&entry.body)),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(path).is_some_and(|e| now >= e.expires_at) {
            entries.remove(path);
        }
        None
    }

    pub fn set(&self, path: &str, body: Arc<str>, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            path.to_string(),
            CacheEntry {
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Store `body` unless the cache was cleared since `generation` was read.
    ///
    /// Keeps a body rendered from a superseded list out of the cache.
    pub fn set_if_current(&self, path: &str, body: Arc<str>, ttl: Duration, generation: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(
            path.to_string(),
            CacheEntry {
                body,
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    /// Drop every entry. Called after each list update.
    pub fn clear_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacCache {
    fn default() -> Self {
        Self::new()
    }
}
