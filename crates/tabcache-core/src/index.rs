//! Cache index: id to storage key mapping, LRU order, category membership
//! and aggregate size.
//!
//! The index is the single owner of the logical id to physical key mapping.
//! Every mutation re-checks the structural invariants; a violation is a logic
//! defect, so debug builds panic immediately and release builds abort the
//! current operation with `CacheError::IndexInvariant`.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub storage_key: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    items: BTreeMap<String, IndexEntry>,
    /// Least recently used at the front, most recently used at the back
    lru_order: VecDeque<String>,
    categories: BTreeMap<String, BTreeSet<String>>,
    total_size_bytes: u64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn entry(&self, id: &str) -> Option<&IndexEntry> {
        self.items.get(id)
    }

    pub fn storage_key(&self, id: &str) -> Option<&str> {
        self.items.get(id).map(|e| e.storage_key.as_str())
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    /// Ids from least to most recently used.
    pub fn lru_iter(&self) -> impl Iterator<Item = &str> {
        self.lru_order.iter().map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn ids_in_category(&self, category: &str) -> Vec<String> {
        self.categories
            .get(category)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ===== Mutations =====

    /// Insert or replace `id`, marking it most recently used.
    pub fn admit(
        &mut self,
        id: &str,
        storage_key: &str,
        category: Option<&str>,
        size_bytes: u64,
    ) -> Result<()> {
        if let Some((owner, _)) = self
            .items
            .iter()
            .find(|(other, e)| other.as_str() != id && e.storage_key == storage_key)
        {
            return Err(CacheError::IndexInvariant(format!(
                "storage key {} already mapped to {}",
                storage_key, owner
            )));
        }

        if self.items.contains_key(id) {
            self.detach(id);
        }

        self.items.insert(
            id.to_string(),
            IndexEntry {
                storage_key: storage_key.to_string(),
                size_bytes,
                category: category.map(str::to_string),
            },
        );
        self.lru_order.push_back(id.to_string());
        if let Some(cat) = category {
            self.categories
                .entry(cat.to_string())
                .or_default()
                .insert(id.to_string());
        }
        self.total_size_bytes = self.total_size_bytes.saturating_add(size_bytes);

        self.verify()
    }

    /// Like `admit`, except an id that is already indexed keeps its place in
    /// the LRU order. Rewriting a record is not a use of it.
    pub fn replace(
        &mut self,
        id: &str,
        storage_key: &str,
        category: Option<&str>,
        size_bytes: u64,
    ) -> Result<()> {
        let Some(pos) = self.lru_order.iter().position(|x| x == id) else {
            return self.admit(id, storage_key, category, size_bytes);
        };
        self.admit(id, storage_key, category, size_bytes)?;
        if let Some(moved) = self.lru_order.pop_back() {
            self.lru_order.insert(pos, moved);
        }
        self.verify()
    }

    /// Mark `id` most recently used. Returns false if it is not indexed.
    pub fn touch(&mut self, id: &str) -> Result<bool> {
        let Some(pos) = self.lru_order.iter().position(|x| x == id) else {
            return Ok(false);
        };
        if let Some(moved) = self.lru_order.remove(pos) {
            self.lru_order.push_back(moved);
        }
        self.verify()?;
        Ok(true)
    }

    /// Least recently used id.
    pub fn evict_candidate(&self) -> Option<&str> {
        self.lru_order.front().map(String::as_str)
    }

    /// Remove `id` from every structure. Absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Result<Option<IndexEntry>> {
        let removed = self.detach(id);
        self.verify()?;
        Ok(removed)
    }

    /// Update the recorded size of an indexed id, keeping the total in step.
    pub fn resize(&mut self, id: &str, size_bytes: u64) -> bool {
        match self.items.get_mut(id) {
            Some(entry) => {
                self.total_size_bytes = self
                    .total_size_bytes
                    .saturating_sub(entry.size_bytes)
                    .saturating_add(size_bytes);
                entry.size_bytes = size_bytes;
                true
            }
            None => false,
        }
    }

    /// Recompute the aggregate size from the entries. Returns the drift that
    /// was corrected (recomputed minus previous).
    pub fn reconcile_size(&mut self) -> i64 {
        let actual: u64 = self.items.values().map(|e| e.size_bytes).sum();
        let drift = actual as i64 - self.total_size_bytes as i64;
        self.total_size_bytes = actual;
        drift
    }

    fn detach(&mut self, id: &str) -> Option<IndexEntry> {
        let entry = self.items.remove(id)?;
        self.lru_order.retain(|x| x != id);
        self.categories.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
        self.total_size_bytes = self.total_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    // ===== Invariants =====

    /// Check the structural invariants without panicking.
    pub fn check_invariants(&self) -> Result<()> {
        if self.lru_order.len() != self.items.len() {
            return Err(CacheError::IndexInvariant(format!(
                "lru order has {} ids but {} items are indexed",
                self.lru_order.len(),
                self.items.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.lru_order.len());
        for id in &self.lru_order {
            if !self.items.contains_key(id) {
                return Err(CacheError::IndexInvariant(format!(
                    "lru id {} is not indexed",
                    id
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(CacheError::IndexInvariant(format!(
                    "lru id {} appears more than once",
                    id
                )));
            }
        }

        let mut keys = HashSet::with_capacity(self.items.len());
        for (id, entry) in &self.items {
            if !keys.insert(entry.storage_key.as_str()) {
                return Err(CacheError::IndexInvariant(format!(
                    "storage key {} is mapped more than once",
                    entry.storage_key
                )));
            }
            if let Some(cat) = &entry.category {
                if !self.categories.get(cat).is_some_and(|ids| ids.contains(id)) {
                    return Err(CacheError::IndexInvariant(format!(
                        "{} is missing from category {}",
                        id, cat
                    )));
                }
            }
        }

        for (cat, ids) in &self.categories {
            for id in ids {
                if self.items.get(id).and_then(|e| e.category.as_deref()) != Some(cat.as_str()) {
                    return Err(CacheError::IndexInvariant(format!(
                        "category {} references {} which is not indexed under it",
                        cat, id
                    )));
                }
            }
        }

        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let result = self.check_invariants();
        if let Err(e) = &result {
            debug_assert!(false, "{}", e);
        }
        result
    }
}
