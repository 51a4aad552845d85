//! The Raft log: durable storage composed with the in-flight cache.
//!
//! Appends write durably first and then cache; reads try the cache and
//! fall back to the store. Mutations are driven only by the Raft loop;
//! readers (the applier, replication streams, the catch-up server) go
//! through `&self`.

use std::sync::Arc;

use anyhow::Result;

use crate::cache::InFlightCache;
use crate::config::Config;
use crate::operation::LogEntry;
use crate::storage::LogStore;
use crate::LogId;

pub struct RaftLog<L: LogStore> {
    store: Arc<L>,
    cache: InFlightCache,
}

impl<L: LogStore> RaftLog<L> {
    pub fn new(store: Arc<L>, config: &Config) -> Self {
        Self {
            store,
            cache: InFlightCache::new(
                config.in_flight_cache_enabled,
                config.in_flight_cache_max_bytes,
                config.in_flight_cache_max_entries,
            ),
        }
    }

    /// Durably append entries, then record them in the in-flight cache.
    pub async fn append(&self, entries: Vec<Arc<LogEntry>>) -> Result<u64> {
        let owned: Vec<LogEntry> = entries.iter().map(|e| e.as_ref().clone()).collect();
        let append_index = self.store.append(&owned).await?;
        for entry in entries {
            self.cache.put(entry);
        }
        Ok(append_index)
    }

    /// Read one entry, preferring the cache.
    pub async fn read_entry(&self, index: u64) -> Result<Option<Arc<LogEntry>>> {
        if let Some(entry) = self.cache.get(index) {
            return Ok(Some(entry));
        }
        Ok(self.store.entry(index).await?.map(Arc::new))
    }

    /// Read a range of entries `[from, to_exclusive)`.
    pub async fn read_entries(&self, from: u64, to_exclusive: u64) -> Result<Vec<Arc<LogEntry>>> {
        let mut entries = Vec::with_capacity((to_exclusive.saturating_sub(from)) as usize);
        let mut cursor = from;
        while cursor < to_exclusive {
            match self.cache.get(cursor) {
                Some(entry) => {
                    entries.push(entry);
                    cursor += 1;
                }
                None => break,
            }
        }
        if cursor < to_exclusive {
            let rest = self.store.entries(cursor, to_exclusive).await?;
            entries.extend(rest.into_iter().map(Arc::new));
        }
        Ok(entries)
    }

    /// The term of the entry at `index`, also answering for the prune
    /// position.
    pub async fn read_entry_term(&self, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.store.prev_index() {
            return Ok(Some(self.store.prev_term()));
        }
        if let Some(entry) = self.cache.get(index) {
            return Ok(Some(entry.log_id.term));
        }
        self.store.entry_term(index).await
    }

    /// Discard entries with `index >= from_index`. The caller guarantees
    /// `from_index` is above the commit index.
    pub async fn truncate(&self, from_index: u64) -> Result<()> {
        self.store.truncate(from_index).await?;
        self.cache.truncate(from_index);
        Ok(())
    }

    /// Prune whole segments up to `up_to_index`, returning the new prev
    /// index.
    pub async fn prune(&self, up_to_index: u64) -> Result<u64> {
        let prev = self.store.prune(up_to_index).await?;
        self.cache.prune(prev);
        Ok(prev)
    }

    /// Discard the whole log after a snapshot installation.
    pub async fn reset(&self, prev: LogId) -> Result<()> {
        self.store.reset(prev).await?;
        self.cache.truncate(0);
        Ok(())
    }

    /// Open a ref-counted streaming reader; pruning of covered segments is
    /// deferred while it lives.
    pub async fn reader(&self, from: u64) -> Result<L::Reader> {
        self.store.reader(from).await
    }

    pub fn append_index(&self) -> u64 {
        self.store.append_index()
    }

    pub fn prev_index(&self) -> u64 {
        self.store.prev_index()
    }

    pub fn prev_term(&self) -> u64 {
        self.store.prev_term()
    }

    pub fn cache(&self) -> &InFlightCache {
        &self.cache
    }
}
