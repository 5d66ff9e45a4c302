//! Capacity enforcement.
//!
//! Two triggers: a storage write that reports `QuotaExceeded`, and the
//! configured item/size budget checked on admission and during maintenance.
//! Both evict in LRU order, never touching the id being written.

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CacheError, Result};
use crate::index::CacheIndex;
use crate::metrics::MetricsRecorder;
use crate::store::{Storage, StoreError};

/// A record write, conditional on what its key holds right now.
#[derive(Debug, Clone, Copy)]
pub struct RecordWrite<'a> {
    pub key: &'a str,
    /// Bytes the key must still hold; `None` when it must be absent
    pub expected: Option<&'a [u8]>,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct EvictionManager {
    max_attempts: u32,
    max_items: usize,
    max_size_bytes: u64,
}

impl EvictionManager {
    pub fn new(max_attempts: u32, max_items: usize, max_size_bytes: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_items,
            max_size_bytes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.eviction_attempts,
            config.max_items,
            config.max_size_bytes,
        )
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Whether a single record of `size_bytes` can ever fit the budget.
    pub fn fits(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_size_bytes
    }

    /// Evict the least recently used id other than `protect`.
    pub fn evict_one(
        &self,
        store: &dyn Storage,
        index: &mut CacheIndex,
        metrics: &MetricsRecorder,
        protect: Option<&str>,
    ) -> Result<Option<String>> {
        let candidate = match protect {
            None => index.evict_candidate().map(str::to_string),
            Some(p) => index.lru_iter().find(|id| *id != p).map(str::to_string),
        };
        let Some(id) = candidate else {
            return Ok(None);
        };

        if let Some(key) = index.storage_key(&id) {
            store.delete(key)?;
        }
        index.remove(&id)?;
        metrics.record_eviction(&id);
        debug!(id = %id, "Evicted least recently used record");
        Ok(Some(id))
    }

    /// Make room for an incoming record of `incoming_bytes` (zero during
    /// maintenance) so that item count and total size stay within budget.
    pub fn enforce_budget(
        &self,
        store: &dyn Storage,
        index: &mut CacheIndex,
        metrics: &MetricsRecorder,
        protect: Option<&str>,
        incoming_bytes: u64,
    ) -> Result<Vec<String>> {
        // An overwrite replaces the protected entry, so its slot and bytes
        // are already accounted for.
        let replaced = protect.and_then(|p| index.entry(p)).map(|e| e.size_bytes);
        let incoming_items = usize::from(incoming_bytes > 0 && replaced.is_none());

        let mut evicted = Vec::new();
        loop {
            let size_after = index
                .total_size_bytes()
                .saturating_sub(replaced.unwrap_or(0))
                .saturating_add(incoming_bytes);
            let items_after = index.len() + incoming_items;
            if items_after <= self.max_items && size_after <= self.max_size_bytes {
                break;
            }
            match self.evict_one(store, index, metrics, protect)? {
                Some(id) => evicted.push(id),
                None => break,
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted records to stay within budget");
        }
        Ok(evicted)
    }

    /// Perform `write`, evicting and retrying while the store reports quota
    /// pressure. Gives up with `StorageFull` once the attempt budget is spent
    /// or nothing evictable remains.
    ///
    /// Returns `Ok(None)` when the key no longer holds `write.expected`:
    /// another writer got there first and nothing was written.
    pub fn write(
        &self,
        store: &dyn Storage,
        index: &mut CacheIndex,
        metrics: &MetricsRecorder,
        protect: Option<&str>,
        write: RecordWrite<'_>,
    ) -> Result<Option<Vec<String>>> {
        let RecordWrite { key, expected, bytes } = write;
        let mut evicted = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match store.set_if(key, expected, bytes) {
                Ok(true) => return Ok(Some(evicted)),
                Ok(false) => {
                    debug!(key, attempt, "Stored value changed before the write landed");
                    return Ok(None);
                }
                Err(StoreError::QuotaExceeded { needed, available }) => {
                    if attempt >= self.max_attempts {
                        warn!(key, attempt, needed, available, "Eviction attempts exhausted");
                        return Err(self.storage_full(protect, key, bytes, attempt));
                    }
                    match self.evict_one(store, index, metrics, protect)? {
                        Some(id) => evicted.push(id),
                        None => {
                            warn!(key, needed, available, "Quota exceeded with nothing left to evict");
                            return Err(self.storage_full(protect, key, bytes, attempt));
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn storage_full(&self, protect: Option<&str>, key: &str, bytes: &[u8], attempts: u32) -> CacheError {
        CacheError::StorageFull {
            id: protect.unwrap_or(key).to_string(),
            size_bytes: bytes.len() as u64,
            attempts,
        }
    }
}
