// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process LRU cache with per-entry TTL.
//!
//! Backs two independent stores: the query result cache and the server's
//! idempotency cache. Entries expire lazily on read; a scan-based purge is
//! available for callers that want to reclaim memory proactively.
//!
//! All operations take one exclusive lock because LRU promotion mutates the
//! recency order even on reads. The lock is never held across a database
//! call.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// Cache statistics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

enum Lookup {
    Absent,
    Expired,
    Live,
}

/// LRU + TTL cache keyed by caller-supplied strings.
///
/// `default_ttl` of zero means entries never expire unless a per-entry TTL
/// is supplied.
pub struct InMemoryCache<V> {
    name: &'static str,
    inner: Mutex<LruCache<String, Entry<V>>>,
    capacity: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> InMemoryCache<V> {
    /// Create a cache. A zero capacity falls back to 1024 entries.
    /// `name` labels this cache in emitted metrics.
    pub fn new(name: &'static str, capacity: usize, default_ttl: Duration) -> Self {
        let capacity = if capacity == 0 { 1024 } else { capacity };
        // capacity is non-zero here
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            inner: Mutex::new(LruCache::new(cap)),
            capacity,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Look up a key. A hit promotes the entry to most-recently-used; an
    /// expired entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let state = match inner.peek(key) {
            None => Lookup::Absent,
            Some(entry) if entry.is_expired(Instant::now()) => Lookup::Expired,
            Some(_) => Lookup::Live,
        };

        match state {
            Lookup::Absent => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_op(self.name, "miss");
                None
            }
            Lookup::Expired => {
                inner.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_op(self.name, "expired");
                None
            }
            Lookup::Live => {
                let value = inner.get(key).map(|entry| entry.value.clone());
                if value.is_some() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_op(self.name, "hit");
                }
                value
            }
        }
    }

    /// Insert or update a key. A zero `ttl` falls back to the default TTL;
    /// a zero default means no expiry. The LRU victim is evicted when full.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: self.effective_expiry(ttl),
        };
        let mut inner = self.inner.lock();
        if let Some((old_key, _)) = inner.push(key.to_string(), entry) {
            // push returns the replaced value for the same key, or the
            // evicted LRU victim when at capacity
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_op(self.name, "eviction");
            }
        }
    }

    /// Remove a key if present.
    pub fn delete(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Scan for and remove all expired entries.
    pub fn purge_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            inner.pop(key);
        }
        self.expired.fetch_add(stale.len() as u64, Ordering::Relaxed);
    }

    /// Drop every entry, keeping the counters.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            items: self.inner.lock().len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn effective_expiry(&self, ttl: Duration) -> Option<Instant> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}
