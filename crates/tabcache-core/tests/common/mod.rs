#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tabcache_core::testing::{ManualClock, StaticOrigin};
use tabcache_core::{ContentCache, EngineConfig, RetryPolicy, Storage};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

/// Defaults with background retries off, so tests drive every fetch.
pub fn config() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy {
        enabled: false,
        ..Default::default()
    })
}

pub fn engine(
    store: Arc<dyn Storage>,
    origin: Arc<StaticOrigin>,
    clock: Arc<ManualClock>,
    config: EngineConfig,
) -> ContentCache {
    ContentCache::builder(store, origin)
        .config(config)
        .clock(clock)
        .init()
        .unwrap()
}
