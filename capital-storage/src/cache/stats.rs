//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a cache engine.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub single_fetches: AtomicU64,
    pub batch_fetches: AtomicU64,
    pub store_errors: AtomicU64,
    pub refreshes: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64, pending_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            single_fetches: self.single_fetches.load(Ordering::Relaxed),
            batch_fetches: self.batch_fetches.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entry_count,
            pending_count,
        }
    }
}

/// Statistics about cache usage at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a fresh entry.
    pub hits: u64,
    /// Lookups that started a new store fetch.
    pub misses: u64,
    /// Lookups that joined a fetch already in flight.
    pub coalesced: u64,
    /// Single-key store round trips.
    pub single_fetches: u64,
    /// Batched store round trips.
    pub batch_fetches: u64,
    /// Store round trips that failed.
    pub store_errors: u64,
    /// Forced refreshes.
    pub refreshes: u64,
    /// Entries removed by explicit eviction.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries currently cached.
    pub entry_count: u64,
    /// Fetches currently in flight.
    pub pending_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Coalesced lookups count as misses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total store round trips, single and batched.
    pub fn store_calls(&self) -> u64 {
        self.single_fetches + self.batch_fetches
    }
}
