//! In-process cache tier.
//!
//! A [`DashMap`] keyed by string with a per-entry expiry deadline. Expired
//! entries are never returned: they are dropped lazily when touched by
//! [`get`](MemoryCache::get)/[`has`](MemoryCache::has) and in bulk by
//! [`clear_expired`](MemoryCache::clear_expired).
//!
//! Deadlines use [`tokio::time::Instant`] so paused-clock tests can advance
//! time; outside a runtime it behaves like `std::time::Instant`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Default time-to-live for entries written without an explicit TTL: 1 hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Stand-in deadline for lifetimes too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `from + after`, or a deadline decades out if that would overflow.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Remaining lifetime of one live entry, as reported by [`MemoryCache::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub key: String,
    pub expires_in: Duration,
}

/// Diagnostic snapshot of the memory tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub entries: Vec<EntryStats>,
}

/// Thread-safe key/value map with per-entry TTL.
pub struct MemoryCache<V = serde_json::Value> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        tracing::trace!(key = %key, ttl_secs = ttl.as_secs(), "memory cache set");
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: deadline_after(Instant::now(), ttl),
            },
        );
    }

    /// Look up `key`. Returns `None` if absent or expired; an expired entry
    /// is removed as a side effect.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key, "memory cache hit");
                return Some(entry.value.clone());
            }
            drop(entry);
            // Only drop it if nobody refreshed the key in the meantime.
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key, "memory cache miss");
        None
    }

    /// Whether a live entry exists for `key`. Same expiry rules as `get`,
    /// but does not count towards hit/miss statistics.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => true,
            Some(entry) => {
                drop(entry);
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                false
            }
            None => false,
        }
    }

    /// Remove one entry, returning its value if it was still live.
    pub fn remove(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(_, e)| e.value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Delete all expired entries. Returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            tracing::debug!(removed, "memory cache swept expired entries");
        }
        removed
    }

    /// Purge expired entries, then report what is left, sorted by key.
    pub fn stats(&self) -> CacheStats {
        self.clear_expired();
        let now = Instant::now();
        let mut entries: Vec<EntryStats> = self
            .entries
            .iter()
            .map(|e| EntryStats {
                key: e.key().clone(),
                expires_in: e.expires_at.saturating_duration_since(now),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        CacheStats {
            size: entries.len(),
            entries,
        }
    }

    /// Number of stored entries, including any not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of `get` hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of `get` misses (absent or expired) since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("default_ttl", &self.default_ttl)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}
