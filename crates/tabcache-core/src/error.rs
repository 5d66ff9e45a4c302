use thiserror::Error;

use crate::origin::OriginError;
use crate::store::StoreError;

/// Engine error taxonomy.
///
/// Most variants are recovered inside the engine and translated into a
/// [`Lookup`](crate::Lookup) or [`WriteOutcome`](crate::WriteOutcome) before
/// reaching the caller. `IndexInvariant` is the only one that signals a
/// logic defect.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No cached record for {0}")]
    NotFound(String),

    #[error("Cached record {0} has expired")]
    Expired(String),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage full - could not admit {id} ({size_bytes} bytes) after {attempts} attempts")]
    StorageFull {
        id: String,
        size_bytes: u64,
        attempts: u32,
    },

    #[error("Origin unavailable: {0}")]
    NetworkFailure(#[from] OriginError),

    #[error("Fetch for {key} timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("Fetch for {0} was cancelled")]
    Cancelled(String),

    #[error("Conflicting writes to {id} on fields {fields:?}")]
    Conflict { id: String, fields: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache index invariant violated: {0}")]
    IndexInvariant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl CacheError {
    /// True for failures of the origin round trip that should push the
    /// controller into its fallback branch.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            CacheError::NetworkFailure(_) | CacheError::Timeout { .. } | CacheError::Cancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failure_classification() {
        let timeout = CacheError::Timeout {
            key: "a".to_string(),
            timeout_ms: 5000,
        };
        assert!(timeout.is_fetch_failure());
        assert!(CacheError::Cancelled("a".to_string()).is_fetch_failure());
        assert!(CacheError::NetworkFailure(OriginError::ServerError("boom".to_string()))
            .is_fetch_failure());
        assert!(!CacheError::NotFound("a".to_string()).is_fetch_failure());
        assert!(!CacheError::IndexInvariant("bad".to_string()).is_fetch_failure());
    }

    #[test]
    fn test_storage_full_message() {
        let err = CacheError::StorageFull {
            id: "big".to_string(),
            size_bytes: 10,
            attempts: 8,
        };
        assert_eq!(
            err.to_string(),
            "Storage full - could not admit big (10 bytes) after 8 attempts"
        );
    }
}
