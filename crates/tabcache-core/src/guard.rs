//! Corruption guard.
//!
//! Every stored record is decoded and shape-checked on read. Anything that
//! fails is quarantined: deleted from storage, dropped from the index and
//! counted. Callers only ever see "missing".

use tracing::{debug, warn};

use crate::error::Result;
use crate::index::CacheIndex;
use crate::metrics::MetricsRecorder;
use crate::record::{CacheRecord, Content};
use crate::store::{KeyLayout, Storage};

/// Decode and validate a stored record.
pub fn inspect(bytes: &[u8], expected_id: &str) -> std::result::Result<CacheRecord, String> {
    let record: CacheRecord =
        serde_json::from_slice(bytes).map_err(|e| format!("undecodable record: {}", e))?;
    validate(&record, expected_id)?;
    Ok(record)
}

/// Shape rules a decoded record must satisfy.
pub fn validate(record: &CacheRecord, expected_id: &str) -> std::result::Result<(), String> {
    if record.id.is_empty() {
        return Err("empty id".to_string());
    }
    if record.id != expected_id {
        return Err(format!("stored id {} does not match {}", record.id, expected_id));
    }
    if record.content.content_type() != record.content_type {
        return Err(format!(
            "content is {} but record declares {}",
            record.content.content_type(),
            record.content_type
        ));
    }
    if record.expires_at < record.cached_at {
        return Err("expires before it was cached".to_string());
    }
    if record.version == 0 {
        return Err("version must start at 1".to_string());
    }
    if let Content::BinaryRef { uri, .. } = &record.content {
        if uri.trim().is_empty() {
            return Err("binary reference has an empty uri".to_string());
        }
    }
    Ok(())
}

/// Remove `id` from storage and index. Returns false when there was nothing
/// to remove, in which case nothing is counted.
pub fn quarantine(
    store: &dyn Storage,
    index: &mut CacheIndex,
    metrics: &MetricsRecorder,
    layout: &KeyLayout,
    id: &str,
) -> Result<bool> {
    let canonical = layout.content_key(id);
    let mut keys = vec![canonical.clone()];
    if let Some(indexed) = index.storage_key(id) {
        if indexed != canonical {
            keys.push(indexed.to_string());
        }
    }

    let mut present = false;
    for key in &keys {
        if store.get(key)?.is_some() {
            present = true;
            store.delete(key)?;
        }
    }
    let indexed = index.remove(id)?.is_some();

    if present || indexed {
        metrics.record_corruption(id);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// A record as found in storage, with the exact bytes it decoded from.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: String,
    pub bytes: Vec<u8>,
    pub record: CacheRecord,
}

/// Read `id` through the guard. Corrupt entries are quarantined and read as
/// `None`; so are index entries whose storage entry has disappeared.
pub fn read(
    store: &dyn Storage,
    index: &mut CacheIndex,
    metrics: &MetricsRecorder,
    layout: &KeyLayout,
    id: &str,
) -> Result<Option<CacheRecord>> {
    Ok(read_stored(store, index, metrics, layout, id)?.map(|stored| stored.record))
}

/// Like `read`, keeping the stored bytes for a later conditional write.
pub fn read_stored(
    store: &dyn Storage,
    index: &mut CacheIndex,
    metrics: &MetricsRecorder,
    layout: &KeyLayout,
    id: &str,
) -> Result<Option<StoredRecord>> {
    let key = index
        .storage_key(id)
        .map(str::to_string)
        .unwrap_or_else(|| layout.content_key(id));

    let Some(bytes) = store.get(&key)? else {
        if index.remove(id)?.is_some() {
            debug!(id, "Dropped index entry with no stored record");
        }
        return Ok(None);
    };

    match inspect(&bytes, id) {
        Ok(record) => Ok(Some(StoredRecord { key, bytes, record })),
        Err(reason) => {
            warn!(id, key = %key, reason = %reason, "Quarantining corrupt cache record");
            quarantine(store, index, metrics, layout, id)?;
            Ok(None)
        }
    }
}
