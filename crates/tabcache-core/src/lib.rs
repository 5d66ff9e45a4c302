//! tabcache core - client-resident content cache with origin fallback.
//!
//! This crate provides the `ContentCache` engine and everything it is built
//! from. Each tab runs its own engine; tabs may share one `Storage` and one
//! `SyncBus`, coordinating through record versions rather than locks.
//!
//! Components, leaf first:
//! - `store`: durable key/value adapters (`MemoryStore`, `FileStore`)
//! - `guard`: record validation and quarantine
//! - `index`: id to storage key mapping, LRU order, categories
//! - `expiry`: freshness decision and clocks
//! - `eviction`: item/size budget and quota recovery
//! - `conflict`: version checks and field-level merges
//! - `fallback`: sync mode state machine, subscribers, cancellation
//! - `metrics`: hit/miss/eviction/corruption counters

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod expiry;
pub mod fallback;
pub mod guard;
pub mod index;
pub mod metrics;
pub mod origin;
pub mod record;
pub mod store;
pub mod sync;
pub mod testing;

pub use config::{EngineConfig, RetryPolicy};
pub use conflict::{ContentPatch, FieldConflict};
pub use engine::{
    ContentCache, ContentCacheBuilder, Lookup, MaintenanceReport, PendingUpdate, Source,
    WriteOutcome,
};
pub use error::{CacheError, Result};
pub use expiry::{Clock, Freshness, SystemClock};
pub use fallback::{Canceller, FallbackState, FetchToken, ModeChange, SubscriptionId, SyncMode};
pub use metrics::{CacheMetadata, CacheStats};
pub use origin::{ContentFetcher, HttpOrigin, OriginError, OriginItem};
pub use record::{CacheRecord, Content, ContentType};
pub use store::{FileStore, MemoryStore, Storage, StoreError};
pub use sync::{ChangeNotice, SyncBus, TabId};
