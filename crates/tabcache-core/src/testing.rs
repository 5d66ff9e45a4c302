//! Test doubles for hosts and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::expiry::ManualClock;
use crate::origin::{ContentFetcher, OriginError, OriginItem};
use crate::record::ContentType;

/// Scriptable in-memory origin.
#[derive(Debug, Default)]
pub struct StaticOrigin {
    items: Mutex<HashMap<String, OriginItem>>,
    offline: AtomicBool,
    server_error: AtomicBool,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl StaticOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `item` under its own id.
    pub fn with_item(self, item: OriginItem) -> Self {
        self.insert(item.id.clone(), item);
        self
    }

    /// Serve `item` under an arbitrary lookup key.
    pub fn insert(&self, key: impl Into<String>, item: OriginItem) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), item);
    }

    pub fn remove(&self, key: &str) -> Option<OriginItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Fail every fetch with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail every fetch with a 5xx.
    pub fn set_server_error(&self, failing: bool) {
        self.server_error.store(failing, Ordering::SeqCst);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentFetcher for StaticOrigin {
    async fn fetch(&self, key: &str) -> Result<OriginItem, OriginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(OriginError::Network("origin unreachable".to_string()));
        }
        if self.server_error.load(Ordering::SeqCst) {
            return Err(OriginError::ServerError("503 Service Unavailable".to_string()));
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| OriginError::NotFound(key.to_string()))
    }
}

pub fn text_item(id: &str, text: &str) -> OriginItem {
    OriginItem::new(id, ContentType::Text, Value::String(text.to_string()))
}

pub fn json_item(id: &str, value: Value) -> OriginItem {
    OriginItem::new(id, ContentType::Json, value)
}
