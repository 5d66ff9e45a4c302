//! Durable key/value storage adapters.
//!
//! This module provides the `Storage` trait the engine persists through,
//! plus two implementations:
//! - `MemoryStore`: quota-limited in-process store, shared between tabs
//! - `FileStore`: one file per key under a directory
//!
//! Adapters never interpret the bytes they hold. Running out of space is
//! reported as `StoreError::QuotaExceeded`, which callers treat as a signal
//! to evict and retry rather than a fatal error.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Quota exceeded - need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// Client-local key/value store.
///
/// `set` must be atomic per key: readers see either the previous value or
/// the new one, never a partial write.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Write `value` only if `key` still holds `expected` (`None`: absent).
    ///
    /// Returns `Ok(false)` and leaves the store untouched when another writer
    /// changed the key first. The compare and the write are one atomic step
    /// with respect to every other `set`, `set_if` and `delete` on the store.
    fn set_if(&self, key: &str, expected: Option<&[u8]>, value: &[u8]) -> Result<bool, StoreError>;

    /// Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// Key layout
// ============================================================================

/// Namespaced key layout shared by every tab using the same store.
///
/// - `<namespace>_content_<id>` holds one serialized record
/// - `<namespace>_metadata` holds the aggregate metadata
/// - `<namespace>_index` holds the cache index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn content_prefix(&self) -> String {
        format!("{}_content_", self.namespace)
    }

    pub fn content_key(&self, id: &str) -> String {
        format!("{}_content_{}", self.namespace, id)
    }

    pub fn metadata_key(&self) -> String {
        format!("{}_metadata", self.namespace)
    }

    pub fn index_key(&self) -> String {
        format!("{}_index", self.namespace)
    }

    /// Keys other than records that the namespace owns.
    pub fn bookkeeping_keys(&self) -> [String; 2] {
        [self.index_key(), self.metadata_key()]
    }

    /// Namespaces are non-empty and limited to ASCII letters, digits and
    /// `-`. Without `_` no namespace's keys can start with another's.
    pub fn check_namespace(namespace: &str) -> Result<(), String> {
        if namespace.is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        match namespace.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
            Some(c) => Err(format!("namespace {:?} contains {:?}", namespace, c)),
            None => Ok(()),
        }
    }

    /// Recover the record id from a content key, if it is one.
    pub fn id_from_content_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.content_prefix())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout_formats() {
        let layout = KeyLayout::new("app");
        assert_eq!(layout.content_key("test-content-123"), "app_content_test-content-123");
        assert_eq!(layout.metadata_key(), "app_metadata");
        assert_eq!(layout.index_key(), "app_index");
        assert_eq!(layout.bookkeeping_keys(), ["app_index".to_string(), "app_metadata".to_string()]);
    }

    #[test]
    fn test_namespace_rules() {
        assert!(KeyLayout::check_namespace("tabcache").is_ok());
        assert!(KeyLayout::check_namespace("app-v2").is_ok());
        assert!(KeyLayout::check_namespace("app_v2").is_err());
        assert!(KeyLayout::check_namespace("").is_err());
        assert!(KeyLayout::check_namespace("a b").is_err());
    }

    #[test]
    fn test_id_from_content_key() {
        let layout = KeyLayout::new("app");
        assert_eq!(layout.id_from_content_key("app_content_abc"), Some("abc"));
        assert_eq!(layout.id_from_content_key("app_content_"), None);
        assert_eq!(layout.id_from_content_key("app_index"), None);
        assert_eq!(layout.id_from_content_key("other_content_abc"), None);
    }

    #[test]
    fn test_quota_classification() {
        let err = StoreError::QuotaExceeded {
            needed: 10,
            available: 2,
        };
        assert!(err.is_quota_exceeded());
        assert!(!StoreError::InvalidKey("".to_string()).is_quota_exceeded());
    }
}
