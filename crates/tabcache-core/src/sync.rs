//! Cross-tab change notification.
//!
//! Tabs share one storage area. After a tab writes a record or the index it
//! publishes a `ChangeNotice` on the bus; other tabs treat any notice from a
//! different origin as a hint that their in-memory index is stale and reload
//! it from storage before their next operation. Storage stays the source of
//! truth, so a missed notice (lagged receiver) only costs one extra reload.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Notices buffered per receiver before the oldest are dropped
pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn random() -> Self {
        let n: u64 = rand::thread_rng().gen();
        Self(format!("tab-{:016x}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    /// Storage key that changed
    pub key: String,
    /// Record version after the change, `None` for deletes and index writes
    pub new_version: Option<u64>,
    pub origin: TabId,
}

/// Broadcast channel shared by every tab on one storage area.
#[derive(Debug, Clone)]
pub struct SyncBus {
    tx: broadcast::Sender<ChangeNotice>,
}

impl SyncBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a notice. Having no other tabs listening is fine.
    pub fn publish(&self, notice: ChangeNotice) {
        trace!(key = %notice.key, origin = %notice.origin, "Publishing change notice");
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SyncBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
