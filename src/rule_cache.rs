//! Bounded, TTL-governed local cache of resolved rule sets.
//!
//! Backed by `moka`: TTL on write, LRU-style size bound, and an eviction
//! listener feeding the statistics counters. Shared and thread-safe;
//! expiration maintenance runs inside the cache, callers never block on it.

use moka::notification::RemovalCause;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::rule::RuleSet;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

/// In-process `ruleSetId -> RuleSet` cache.
pub struct RuleCache {
    inner: Cache<String, Arc<RuleSet>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl RuleCache {
    pub fn new(ttl: Duration, max_size: u64) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let eviction_counter = Arc::clone(&evictions);
        let inner = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_size)
            .eviction_listener(move |_key, _value, cause| {
                // Explicit removal is reload invalidation, not eviction.
                if matches!(cause, RemovalCause::Expired | RemovalCause::Size) {
                    eviction_counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    pub fn get(&self, rule_set_id: &str) -> Option<Arc<RuleSet>> {
        match self.inner.get(rule_set_id) {
            Some(rule_set) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(rule_set)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, rule_set: Arc<RuleSet>) {
        self.inner.insert(rule_set.id.clone(), rule_set);
    }

    pub fn invalidate(&self, rule_set_id: &str) {
        self.inner.invalidate(rule_set_id);
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Ids currently resident. The polling reload strategy uses this as its
    /// working set: only rule sets someone has resolved get polled.
    pub fn cached_ids(&self) -> Vec<String> {
        // Flush moka's write buffers so fresh inserts are visible to iter.
        self.inner.run_pending_tasks();
        self.inner.iter().map(|(key, _)| key.as_ref().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        // moka batches housekeeping; flush so entry_count is current.
        self.inner.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.inner.entry_count(),
        }
    }
}
