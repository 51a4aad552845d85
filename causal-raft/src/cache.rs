//! The in-flight entry cache.
//!
//! A bounded, index-keyed cache of recent log entries bridging replication
//! to local application: the applier and the replication streams usually
//! find freshly appended entries here and never touch the disk. Writes
//! (put, truncate, prune) come only from the Raft loop; reads are
//! concurrent.
//!
//! When disabled all operations are no-ops and `get` reports a miss, so
//! callers fall back to the durable log. Disabling a populated cache
//! drains it.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use crate::operation::LogEntry;

/// Hit/miss counters, readable without taking the cache lock.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct CacheInner {
    enabled: bool,
    /// Entries for the contiguous index range `[first, first + entries.len())`.
    entries: std::collections::VecDeque<Arc<LogEntry>>,
    first: u64,
    total_bytes: u64,
    max_bytes: u64,
    max_entries: u64,
}

impl CacheInner {
    fn clear(&mut self) {
        self.entries.clear();
        self.first = 0;
        self.total_bytes = 0;
    }

    fn evict_oldest(&mut self) {
        if let Some(evicted) = self.entries.pop_front() {
            self.total_bytes -= evicted.payload.size_bytes();
            self.first += 1;
        }
    }

    fn enforce_bounds(&mut self) {
        while self.entries.len() as u64 > self.max_entries
            || (self.total_bytes > self.max_bytes && !self.entries.is_empty())
        {
            self.evict_oldest();
        }
        // A single entry larger than the byte bound is not cached at all.
        if self.total_bytes > self.max_bytes {
            self.clear();
        }
    }
}

/// See the module docs.
#[derive(Debug)]
pub struct InFlightCache {
    inner: RwLock<CacheInner>,
    stats: CacheStats,
}

impl InFlightCache {
    pub fn new(enabled: bool, max_bytes: u64, max_entries: u64) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                enabled,
                entries: std::collections::VecDeque::new(),
                first: 0,
                total_bytes: 0,
                max_bytes,
                max_entries,
            }),
            stats: CacheStats::default(),
        }
    }

    /// Record an appended entry. No-op when disabled.
    pub fn put(&self, entry: Arc<LogEntry>) {
        let mut inner = self.inner.write().unwrap();
        if !inner.enabled {
            return;
        }
        let index = entry.log_id.index;
        if inner.entries.is_empty() {
            inner.first = index;
        } else if index != inner.first + inner.entries.len() as u64 {
            // A non-contiguous put invalidates the window.
            inner.clear();
            inner.first = index;
        }
        inner.total_bytes += entry.payload.size_bytes();
        inner.entries.push_back(entry);
        inner.enforce_bounds();
    }

    /// Look up an entry by index. Counts towards the hit/miss gauge.
    pub fn get(&self, index: u64) -> Option<Arc<LogEntry>> {
        let inner = self.inner.read().unwrap();
        let found = if inner.enabled && index >= inner.first {
            inner.entries.get((index - inner.first) as usize).cloned()
        } else {
            None
        };
        match &found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Drop cached entries with `index >= from_index`, mirroring a log
    /// truncation.
    pub fn truncate(&self, from_index: u64) {
        let mut inner = self.inner.write().unwrap();
        if !inner.enabled || inner.entries.is_empty() {
            return;
        }
        if from_index <= inner.first {
            inner.clear();
            return;
        }
        while inner.first + inner.entries.len() as u64 > from_index {
            if let Some(evicted) = inner.entries.pop_back() {
                inner.total_bytes -= evicted.payload.size_bytes();
            }
        }
    }

    /// Drop cached entries with `index <= up_to_index`, mirroring a log
    /// prune.
    pub fn prune(&self, up_to_index: u64) {
        let mut inner = self.inner.write().unwrap();
        if !inner.enabled {
            return;
        }
        while !inner.entries.is_empty() && inner.first <= up_to_index {
            inner.evict_oldest();
        }
    }

    /// Enable or disable the cache. Disabling drains it.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.write().unwrap();
        if inner.enabled && !enabled {
            inner.clear();
        }
        inner.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().unwrap().enabled
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::Rng;

    use super::*;
    use crate::operation::EntryPayload;
    use crate::operation::ReplicatedContent;
    use crate::operation::DistributedOperation;
    use crate::operation::GlobalSession;
    use crate::operation::LocalOperationId;
    use crate::LogId;
    use crate::MemberId;

    fn entry(index: u64, size: u32) -> Arc<LogEntry> {
        Arc::new(LogEntry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Operation(DistributedOperation::new(
                GlobalSession::new(MemberId::from_u128(1)),
                LocalOperationId {
                    local_session_id: 0,
                    sequence_number: index,
                },
                ReplicatedContent::Dummy { size },
            )),
        })
    }

    #[test]
    fn hit_and_miss_accounting() {
        let cache = InFlightCache::new(true, 1024, 16);
        cache.put(entry(1, 10));
        cache.put(entry(2, 10));

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_none());
        assert_eq!(cache.stats().hits(), 2);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn byte_bound_evicts_oldest() {
        let cache = InFlightCache::new(true, 100, 16);
        cache.put(entry(1, 60));
        cache.put(entry(2, 60));
        // Entry 1 must have been evicted to stay under the bound.
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.total_bytes() <= 100);
    }

    #[test]
    fn total_bytes_never_exceeds_bound() {
        let cache = InFlightCache::new(true, 1000, 64);
        let mut rng = rand::thread_rng();
        for index in 1..=500u64 {
            cache.put(entry(index, rng.gen_range(0..400)));
            assert!(cache.total_bytes() <= 1000, "cache exceeded its byte bound");
        }
    }

    #[test]
    fn truncate_mirrors_the_log() {
        let cache = InFlightCache::new(true, 1024, 16);
        for index in 1..=5 {
            cache.put(entry(index, 10));
        }
        cache.truncate(3);
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_none());
        assert!(cache.get(4).is_none());
        assert_eq!(cache.total_bytes(), 20);
    }

    #[test]
    fn prune_mirrors_the_log() {
        let cache = InFlightCache::new(true, 1024, 16);
        for index in 1..=5 {
            cache.put(entry(index, 10));
        }
        cache.prune(3);
        assert!(cache.get(3).is_none());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = InFlightCache::new(false, 1024, 16);
        cache.put(entry(1, 10));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn disabling_drains_the_cache() {
        let cache = InFlightCache::new(true, 1024, 16);
        for index in 1..=4 {
            cache.put(entry(index, 10));
        }
        assert_eq!(cache.len(), 4);

        cache.set_enabled(false);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn oversized_entry_is_not_cached() {
        let cache = InFlightCache::new(true, 50, 16);
        cache.put(entry(1, 500));
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
