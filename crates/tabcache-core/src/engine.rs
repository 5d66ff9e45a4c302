//! The content cache engine.
//!
//! One `ContentCache` per tab. It owns the in-memory index and the sync mode,
//! and persists through a `Storage` handle that other tabs may share. Every
//! read goes origin first; when the origin fails or misses its deadline the
//! engine serves the best cached copy it has and reports the degraded mode
//! to subscribers.
//!
//! Locking: one `std::sync::Mutex` guards the per-tab state. It is only held
//! by synchronous sections and never across an `.await`.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ContentPatch, FieldConflict, Resolution};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionManager, RecordWrite};
use crate::expiry::{self, Clock, SystemClock};
use crate::fallback::{
    Canceller, FallbackController, FallbackState, FetchOutcome, FetchToken, ModeChange,
    Subscribers, SubscriptionId, SyncMode,
};
use crate::guard::{self, StoredRecord};
use crate::index::CacheIndex;
use crate::metrics::{CacheMetadata, CacheStats, MetricsRecorder};
use crate::origin::{ContentFetcher, OriginItem};
use crate::record::CacheRecord;
use crate::store::{KeyLayout, Storage};
use crate::sync::{ChangeNotice, SyncBus, TabId};

/// Where a served record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Fetched just now and written through
    Origin,
    /// Origin failed, served a fresh cached copy
    Cache,
    /// Origin failed, served an expired copy (stale serving enabled)
    StaleCache,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit { record: CacheRecord, source: Source },
    Missing,
}

impl Lookup {
    pub fn record(&self) -> Option<&CacheRecord> {
        match self {
            Lookup::Hit { record, .. } => Some(record),
            Lookup::Missing => None,
        }
    }

    pub fn into_record(self) -> Option<CacheRecord> {
        match self {
            Lookup::Hit { record, .. } => Some(record),
            Lookup::Missing => None,
        }
    }

    pub fn source(&self) -> Option<Source> {
        match self {
            Lookup::Hit { source, .. } => Some(*source),
            Lookup::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Lookup::Missing)
    }
}

/// Result of an explicit write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum WriteOutcome {
    Committed {
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    Merged {
        version: u64,
        merged_fields: Vec<String>,
    },
    /// Overlapping fields kept the stored value; non-overlapping changes
    /// were still applied.
    Conflicted {
        version: u64,
        conflicts: Vec<FieldConflict>,
    },
}

impl WriteOutcome {
    pub fn version(&self) -> u64 {
        match self {
            WriteOutcome::Committed { version }
            | WriteOutcome::Merged { version, .. }
            | WriteOutcome::Conflicted { version, .. } => *version,
        }
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self, WriteOutcome::Conflicted { .. })
    }

    /// The committed version, or `CacheError::Conflict` naming the fields
    /// that kept another writer's value.
    pub fn ok_or_conflict(self, id: &str) -> Result<u64> {
        match self {
            WriteOutcome::Conflicted { conflicts, .. } => Err(CacheError::Conflict {
                id: id.to_string(),
                fields: conflicts.into_iter().map(|c| c.field).collect(),
            }),
            other => Ok(other.version()),
        }
    }

    fn from_resolution(resolution: &Resolution) -> Self {
        let version = resolution.record().version;
        match resolution {
            Resolution::Committed(_) => WriteOutcome::Committed { version },
            Resolution::Merged { merged_fields, .. } => WriteOutcome::Merged {
                version,
                merged_fields: merged_fields.clone(),
            },
            Resolution::Conflicted { conflicts, .. } => WriteOutcome::Conflicted {
                version,
                conflicts: conflicts.clone(),
            },
        }
    }
}

/// A tentative write awaiting `confirm` or `rollback`.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    id: String,
    snapshot: CacheRecord,
    version: u64,
    fields: Vec<String>,
}

impl PendingUpdate {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version the tentative value was written at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Last confirmed record, captured before the tentative write.
    pub fn snapshot(&self) -> &CacheRecord {
        &self.snapshot
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Stored records that were missing from the index
    pub adopted: Vec<String>,
    /// Index entries with no stored record
    pub dangling: usize,
    pub quarantined: u64,
    pub expired: Vec<String>,
    pub evicted: Vec<String>,
    /// Correction applied to the aggregate size
    pub size_drift: i64,
}

// ============================================================================
// Builder
// ============================================================================

pub struct ContentCacheBuilder {
    store: Arc<dyn Storage>,
    origin: Arc<dyn ContentFetcher>,
    config: EngineConfig,
    bus: Option<SyncBus>,
    clock: Arc<dyn Clock>,
    tab: Option<TabId>,
}

impl ContentCacheBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share change notices with other tabs on the same store.
    pub fn bus(mut self, bus: SyncBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tab_id(mut self, tab: TabId) -> Self {
        self.tab = Some(tab);
        self
    }

    /// Load index and metadata from storage and start the engine.
    ///
    /// A missing or unreadable index is rebuilt by scanning stored records.
    pub fn init(self) -> Result<ContentCache> {
        KeyLayout::check_namespace(&self.config.namespace).map_err(CacheError::InvalidConfig)?;
        let layout = KeyLayout::new(self.config.namespace.clone());
        let metadata = load_metadata(self.store.as_ref(), &layout)?;
        let tab = self.tab.unwrap_or_else(TabId::random);

        let inner = Inner {
            eviction: EvictionManager::from_config(&self.config),
            metrics: MetricsRecorder::seeded(metadata.stats),
            subscribers: Subscribers::new(),
            state: Mutex::new(EngineState {
                index: CacheIndex::new(),
                fallback: FallbackController::new(self.config.retry.clone()),
                last_cleanup_at: metadata.last_cleanup_at,
                notices: self.bus.as_ref().map(SyncBus::subscribe),
                retry_keys: BTreeSet::new(),
                retry_scheduled: false,
            }),
            tasks: Mutex::new(Vec::new()),
            store: self.store,
            origin: self.origin,
            config: self.config,
            layout,
            clock: self.clock,
            tab,
            bus: self.bus,
        };
        let cache = ContentCache {
            inner: Arc::new(inner),
        };

        let (index, rebuilt) = cache.load_index()?;
        {
            let mut state = cache.lock();
            state.index = index;
            if rebuilt || metadata.total_items != state.index.len() as u64 {
                cache.persist(&mut state).or_else(degraded)?;
            }
            info!(
                tab = %cache.inner.tab,
                namespace = %cache.inner.layout.namespace(),
                items = state.index.len(),
                rebuilt,
                "Cache engine initialised"
            );
        }
        Ok(cache)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Handle to one tab's cache engine. Cloning shares the engine.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Storage>,
    origin: Arc<dyn ContentFetcher>,
    config: EngineConfig,
    layout: KeyLayout,
    clock: Arc<dyn Clock>,
    tab: TabId,
    bus: Option<SyncBus>,
    eviction: EvictionManager,
    metrics: MetricsRecorder,
    subscribers: Subscribers,
    state: Mutex<EngineState>,
    tasks: Mutex<Vec<AbortHandle>>,
}

struct EngineState {
    index: CacheIndex,
    fallback: FallbackController,
    last_cleanup_at: Option<DateTime<Utc>>,
    notices: Option<broadcast::Receiver<ChangeNotice>>,
    /// Keys whose last fetch failed, retried while not fresh
    retry_keys: BTreeSet<String>,
    retry_scheduled: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("tab", &self.inner.tab)
            .field("namespace", &self.inner.layout.namespace())
            .finish()
    }
}

impl ContentCache {
    pub fn builder(store: Arc<dyn Storage>, origin: Arc<dyn ContentFetcher>) -> ContentCacheBuilder {
        ContentCacheBuilder {
            store,
            origin,
            config: EngineConfig::default(),
            bus: None,
            clock: Arc::new(SystemClock),
            tab: None,
        }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.inner.tab
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ===== Reads =====

    /// Fetch `key` from the origin, falling back to the cache.
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        self.get_with_token(key, FetchToken::new()).await
    }

    /// Like `get`, but the fetch stops early if `token` is cancelled.
    /// A cancelled fetch falls back exactly like a failed one.
    pub async fn get_with_token(&self, key: &str, token: FetchToken) -> Result<Lookup> {
        let canceller: Canceller = token.canceller();
        let deadline = self.inner.config.fetch_timeout();
        let fetch = token.wrap(self.inner.origin.fetch(key));

        let fetched = match tokio::time::timeout(deadline, fetch).await {
            Ok(Ok(Ok(item))) => Ok(item),
            Ok(Ok(Err(e))) => Err(CacheError::NetworkFailure(e)),
            Ok(Err(_aborted)) => Err(CacheError::Cancelled(key.to_string())),
            Err(_elapsed) => {
                // The timed-out future is already dropped; a late response
                // has nowhere to land.
                canceller.cancel();
                Err(CacheError::Timeout {
                    key: key.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };

        match fetched {
            Ok(item) => self.accept(key, item),
            Err(CacheError::NetworkFailure(e)) if e.is_not_found() => self.forget(key),
            Err(e) if e.is_fetch_failure() => self.fall_back(key, e),
            Err(e) => Err(e),
        }
    }

    /// Cached, unexpired records in `category`. Never contacts the origin.
    pub fn get_by_category(&self, category: &str) -> Result<Vec<CacheRecord>> {
        let now = self.inner.clock.now();
        let mut state = self.state()?;
        let mut records = Vec::new();

        for id in state.index.ids_in_category(category) {
            let Some(stored) = self.read_stored(&mut state, &id)? else {
                continue;
            };
            if !expiry::status(&stored.record, now).is_fresh() {
                continue;
            }
            state.index.touch(&id)?;
            let mut record = stored.record.clone();
            record.record_access(now);
            self.write_back(&stored, &record);
            self.inner.metrics.record_hit(&id);
            records.push(record);
        }

        if records.is_empty() {
            self.inner.metrics.record_miss(category);
        }
        self.persist(&mut state).or_else(degraded)?;
        Ok(records)
    }

    /// Force `id` to read as expired. Returns false if nothing was cached.
    pub fn invalidate(&self, id: &str) -> Result<bool> {
        let now = self.inner.clock.now();
        let mut state = self.state()?;
        let (written, _) = self.commit(&mut state, id, |current| {
            Ok((
                current.map(|mut record| {
                    record.expire(now);
                    record
                }),
                (),
            ))
        })?;
        if written.is_some() {
            info!(id, "Invalidated cached record");
        }
        Ok(written.is_some())
    }

    /// Ids currently indexed, least recently used first.
    pub fn cached_ids(&self) -> Result<Vec<String>> {
        let state = self.state()?;
        Ok(state.index.lru_iter().map(str::to_string).collect())
    }

    /// Read the stored copy of `id` without fetching, counting, or touching.
    pub fn peek(&self, id: &str) -> Result<Option<CacheRecord>> {
        let mut state = self.state()?;
        self.read(&mut state, id)
    }

    // ===== Writes =====

    /// Apply `patch` to `id`, written against `base_version`.
    ///
    /// A stale base merges disjoint fields; overlapping fields keep the
    /// stored value and come back as conflicts.
    pub fn update(&self, id: &str, base_version: u64, patch: &ContentPatch) -> Result<WriteOutcome> {
        let writer = self.inner.tab.as_str();
        let mut state = self.state()?;
        let (_, outcome) = self.commit(&mut state, id, |current| {
            let current = current.ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            let resolution = ConflictResolver::resolve(&current, base_version, patch, writer)?;
            let write = resolution.needs_write().then(|| resolution.record().clone());
            Ok((write, WriteOutcome::from_resolution(&resolution)))
        })?;

        if let WriteOutcome::Conflicted { conflicts, .. } = &outcome {
            warn!(id, base_version, conflicts = conflicts.len(), "Write conflicted with another writer");
        }
        Ok(outcome)
    }

    /// Write `patch` tentatively, keeping the confirmed record for rollback.
    pub fn begin_update(&self, id: &str, patch: &ContentPatch) -> Result<PendingUpdate> {
        let writer = self.inner.tab.as_str();
        let mut state = self.state()?;
        let (tentative, snapshot) = self.commit(&mut state, id, |current| {
            let snapshot = current.ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            let resolution = ConflictResolver::resolve(&snapshot, snapshot.version, patch, writer)?;
            let mut tentative = resolution.record().clone();
            tentative.pending = true;
            Ok((Some(tentative), snapshot))
        })?;
        let version = tentative.map_or(snapshot.version, |record| record.version);

        debug!(id, version, "Began optimistic update");
        Ok(PendingUpdate {
            id: id.to_string(),
            version,
            fields: patch.touched().map(str::to_string).collect(),
            snapshot,
        })
    }

    /// Clear the pending marker. Returns false if the record is gone.
    pub fn confirm(&self, pending: PendingUpdate) -> Result<bool> {
        let mut state = self.state()?;
        let (_, found) = self.commit(&mut state, &pending.id, |current| match current {
            Some(mut record) if record.pending => {
                record.pending = false;
                Ok((Some(record), true))
            }
            Some(_) => Ok((None, true)),
            None => Ok((None, false)),
        })?;
        if found {
            debug!(id = %pending.id, version = pending.version, "Confirmed optimistic update");
        }
        Ok(found)
    }

    /// Restore the snapshot values of the fields the pending update touched.
    ///
    /// Goes through the conflict resolver: a field another writer changed
    /// after the tentative write keeps their value and is reported.
    pub fn rollback(&self, pending: PendingUpdate) -> Result<WriteOutcome> {
        let writer = self.inner.tab.as_str();
        let snapshot_fields = pending.snapshot.content.fields();
        let mut restore = ContentPatch::new();
        for field in &pending.fields {
            restore = match snapshot_fields.get(field) {
                Some(value) => restore.set(field.clone(), value.clone()),
                None => restore.remove(field.clone()),
            };
        }

        let mut state = self.state()?;
        let (_, outcome) = self.commit(&mut state, &pending.id, |current| {
            let current = current.ok_or_else(|| CacheError::NotFound(pending.id.clone()))?;
            let resolution = ConflictResolver::resolve(&current, pending.version, &restore, writer)?;
            let mut record = resolution.record().clone();
            record.pending = false;
            Ok((Some(record), WriteOutcome::from_resolution(&resolution)))
        })?;

        info!(id = %pending.id, version = outcome.version(), "Rolled back optimistic update");
        Ok(outcome)
    }

    // ===== Observability =====

    /// Register a callback fired on every sync mode transition.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ModeChange) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    pub fn sync_status(&self) -> FallbackState {
        self.lock().fallback.state()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot()
    }

    pub fn metadata(&self) -> Result<CacheMetadata> {
        let state = self.state()?;
        Ok(self.metadata_of(&state))
    }

    // ===== Lifecycle =====

    /// One maintenance pass: reconcile index and storage, drop expired
    /// records, enforce the budget, and correct the aggregate size.
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let now = self.inner.clock.now();
        let store = self.inner.store.as_ref();
        let layout = &self.inner.layout;
        let metrics = &self.inner.metrics;
        let corruptions_before = metrics.snapshot().corruptions;

        let mut state = self.state()?;
        let mut report = MaintenanceReport::default();

        for key in store.keys(&layout.content_prefix())? {
            let Some(id) = layout.id_from_content_key(&key) else {
                continue;
            };
            if state.index.contains(id) {
                continue;
            }
            let Some(bytes) = store.get(&key)? else {
                continue;
            };
            match guard::inspect(&bytes, id) {
                Ok(record) => {
                    state.index.admit(id, &key, record.category.as_deref(), record.size_bytes)?;
                    report.adopted.push(id.to_string());
                }
                Err(reason) => {
                    warn!(key = %key, reason = %reason, "Removing corrupt unindexed record");
                    store.delete(&key)?;
                    metrics.record_corruption(id);
                }
            }
        }

        let ids: Vec<String> = state.index.ids().map(str::to_string).collect();
        for id in ids {
            let corruptions = metrics.snapshot().corruptions;
            let Some(record) = self.read(&mut state, &id)? else {
                if metrics.snapshot().corruptions == corruptions {
                    report.dangling += 1;
                }
                continue;
            };
            if expiry::status(&record, now).is_fresh() {
                // Keep the index in step with what is stored
                state.index.resize(&id, record.size_bytes);
                continue;
            }
            if let Some(key) = state.index.storage_key(&id) {
                store.delete(key)?;
            }
            state.index.remove(&id)?;
            metrics.record_eviction(&id);
            report.expired.push(id);
        }

        report.evicted = self.inner.eviction.enforce_budget(store, &mut state.index, metrics, None, 0)?;
        report.size_drift = state.index.reconcile_size();
        report.quarantined = metrics.snapshot().corruptions - corruptions_before;
        state.last_cleanup_at = Some(now);
        self.persist(&mut state).or_else(degraded)?;
        drop(state);

        self.publish(layout.index_key(), None);
        info!(
            adopted = report.adopted.len(),
            expired = report.expired.len(),
            evicted = report.evicted.len(),
            quarantined = report.quarantined,
            size_drift = report.size_drift,
            "Maintenance pass complete"
        );
        Ok(report)
    }

    /// Run `maintain` every `maintenance_interval_secs`. Must be called from
    /// within a tokio runtime. The task stops once the engine is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval().max(Duration::from_secs(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = (ContentCache { inner }).maintain() {
                    warn!(error = %e, "Background maintenance failed");
                }
            }
        });
        self.track(task.abort_handle());
        task
    }

    /// Remove everything under the namespace and return to the cold-start
    /// state.
    pub fn reset(&self) -> Result<()> {
        let store = self.inner.store.as_ref();
        let change = {
            let mut state = self.state()?;
            let layout = &self.inner.layout;
            for key in store.keys(&layout.content_prefix())? {
                store.delete(&key)?;
            }
            for key in layout.bookkeeping_keys() {
                store.delete(&key)?;
            }
            state.index = CacheIndex::new();
            state.last_cleanup_at = None;
            state.retry_keys.clear();
            self.inner.metrics.reset();
            state.fallback.reset()
        };

        self.publish(self.inner.layout.index_key(), None);
        info!(namespace = %self.inner.layout.namespace(), "Cache reset");
        if let Some(change) = change {
            self.inner.subscribers.notify(&change);
        }
        Ok(())
    }

    /// Stop background tasks and flush index and metadata.
    pub fn teardown(&self) -> Result<()> {
        let tasks: Vec<AbortHandle> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        // Pick up other tabs' changes so the flush does not overwrite them
        let mut state = self.state()?;
        state.retry_keys.clear();
        state.retry_scheduled = false;
        self.persist(&mut state)?;
        debug!(tab = %self.inner.tab, "Cache engine torn down");
        Ok(())
    }

    // ===== Fetch pipeline =====

    /// Origin answered: write through and serve.
    fn accept(&self, key: &str, item: OriginItem) -> Result<Lookup> {
        let content = match item.to_content() {
            Ok(content) => content,
            Err(e) => return self.fall_back(key, CacheError::NetworkFailure(e)),
        };
        let now = self.inner.clock.now();
        let ttl = self.inner.config.ttl();
        let writer = self.inner.tab.as_str();

        let (record, change) = {
            let mut state = self.state()?;
            self.inner.metrics.record_hit(key);
            let record = loop {
                let (current, expected) = self.read_for_write(&mut state, key)?;
                let mut record = match current {
                    Some(current) => ConflictResolver::refresh(
                        &current,
                        content.clone(),
                        item.category.clone(),
                        ttl,
                        now,
                        writer,
                    )?,
                    None => CacheRecord::new(key, item.category.clone(), content.clone(), ttl, now, writer),
                };
                record.record_access(now);

                match self.write_record(&mut state, &record, expected.as_deref()) {
                    Ok(true) => {
                        state.index.touch(key)?;
                        self.persist(&mut state).or_else(degraded)?;
                        self.publish(self.inner.layout.content_key(key), Some(record.version));
                    }
                    Ok(false) => continue,
                    Err(e @ CacheError::StorageFull { .. }) => {
                        warn!(id = key, error = %e, "Serving fetched record without caching it");
                        // Evictions made while trying still need persisting
                        self.persist(&mut state).or_else(degraded)?;
                        self.publish(self.inner.layout.index_key(), None);
                    }
                    Err(e) => return Err(e),
                }
                break record;
            };

            state.retry_keys.remove(key);
            (record, state.fallback.record(FetchOutcome::Succeeded, now))
        };

        debug!(id = key, version = record.version, "Served from origin");
        self.inner.subscribers.notify(&change);
        Ok(Lookup::Hit {
            record,
            source: Source::Origin,
        })
    }

    /// Origin says the content does not exist: drop any cached copy.
    fn forget(&self, key: &str) -> Result<Lookup> {
        let now = self.inner.clock.now();
        let change = {
            let mut state = self.state()?;
            let stored_key = state
                .index
                .storage_key(key)
                .map(str::to_string)
                .unwrap_or_else(|| self.inner.layout.content_key(key));
            let had_copy = self.inner.store.get(&stored_key)?.is_some() || state.index.contains(key);
            if had_copy {
                self.inner.store.delete(&stored_key)?;
                state.index.remove(key)?;
            }
            self.inner.metrics.record_miss(key);
            self.persist(&mut state).or_else(degraded)?;
            if had_copy {
                self.publish(stored_key, None);
                info!(id = key, "Origin no longer has content, dropped cached copy");
            }
            state.retry_keys.remove(key);
            state.fallback.record(FetchOutcome::Succeeded, now)
        };

        self.inner.subscribers.notify(&change);
        Ok(Lookup::Missing)
    }

    /// Fetch failed: serve the best cached copy, if any.
    fn fall_back(&self, key: &str, cause: CacheError) -> Result<Lookup> {
        let now = self.inner.clock.now();
        let (lookup, change) = {
            let mut state = self.state()?;
            let served = match self.read_stored(&mut state, key)? {
                Some(stored) => {
                    let mut record = stored.record.clone();
                    let fresh = expiry::status(&record, now).is_fresh();
                    if fresh || self.inner.config.serve_stale_on_error {
                        state.index.touch(key)?;
                        record.record_access(now);
                        self.write_back(&stored, &record);
                        let source = if fresh { Source::Cache } else { Source::StaleCache };
                        Some((record, source))
                    } else {
                        debug!(id = key, "Cached copy expired");
                        None
                    }
                }
                None => None,
            };

            let outcome = match &served {
                Some((_, Source::Cache)) => {
                    self.inner.metrics.record_hit(key);
                    FetchOutcome::FailedWithCache
                }
                Some(_) => {
                    // Expired copies never count as hits
                    self.inner.metrics.record_miss(key);
                    FetchOutcome::FailedWithCache
                }
                None => {
                    self.inner.metrics.record_miss(key);
                    FetchOutcome::FailedWithoutCache
                }
            };

            self.persist(&mut state).or_else(degraded)?;
            let change = state.fallback.record(outcome, now);
            state.retry_keys.insert(key.to_string());
            self.schedule_retry(&mut state);

            warn!(
                id = key,
                error = %cause,
                mode = %change.to,
                failures = change.state.pending_retry_count,
                "Origin fetch failed"
            );
            let lookup = match served {
                Some((record, source)) => Lookup::Hit { record, source },
                None => Lookup::Missing,
            };
            (lookup, change)
        };

        self.inner.subscribers.notify(&change);
        Ok(lookup)
    }

    fn schedule_retry(&self, state: &mut EngineState) {
        if !self.inner.config.retry.enabled || state.retry_scheduled {
            return;
        }
        let Some(delay) = state.fallback.next_retry_delay() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            debug!("No runtime available, not scheduling retries");
            return;
        };

        state.retry_scheduled = true;
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(retry_loop(weak, delay));
        self.track(task.abort_handle());
        debug!(backoff_ms = delay.as_millis() as u64, "Scheduled origin retry");
    }

    // ===== Storage plumbing =====

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state, reloading the index first if another tab changed
    /// storage since the last operation.
    fn state(&self) -> Result<MutexGuard<'_, EngineState>> {
        let mut state = self.lock();
        if self.drain_notices(&mut state) {
            let (index, _) = self.load_index()?;
            debug!(tab = %self.inner.tab, items = index.len(), "Reloaded index after change from another tab");
            state.index = index;
        }
        Ok(state)
    }

    fn drain_notices(&self, state: &mut EngineState) -> bool {
        let Some(rx) = state.notices.as_mut() else {
            return false;
        };
        let mut stale = false;
        loop {
            match rx.try_recv() {
                Ok(notice) => {
                    if notice.origin != self.inner.tab {
                        stale = true;
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Change notices lagged");
                    stale = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        stale
    }

    fn read(&self, state: &mut EngineState, id: &str) -> Result<Option<CacheRecord>> {
        guard::read(
            self.inner.store.as_ref(),
            &mut state.index,
            &self.inner.metrics,
            &self.inner.layout,
            id,
        )
    }

    fn read_stored(&self, state: &mut EngineState, id: &str) -> Result<Option<StoredRecord>> {
        guard::read_stored(
            self.inner.store.as_ref(),
            &mut state.index,
            &self.inner.metrics,
            &self.inner.layout,
            id,
        )
    }

    /// The current record, plus the stored bytes a write must still find.
    fn read_for_write(
        &self,
        state: &mut EngineState,
        id: &str,
    ) -> Result<(Option<CacheRecord>, Option<Vec<u8>>)> {
        Ok(match self.read_stored(state, id)? {
            Some(stored) => (Some(stored.record), Some(stored.bytes)),
            None => (None, None),
        })
    }

    /// Store `record` if its key still holds `expected`, and index it,
    /// evicting as needed. Returns false when another writer changed the
    /// record first; nothing is written then.
    fn write_record(
        &self,
        state: &mut EngineState,
        record: &CacheRecord,
        expected: Option<&[u8]>,
    ) -> Result<bool> {
        let store = self.inner.store.as_ref();
        let eviction = &self.inner.eviction;
        let metrics = &self.inner.metrics;
        let id = record.id.as_str();

        if !eviction.fits(record.size_bytes) {
            return Err(CacheError::StorageFull {
                id: id.to_string(),
                size_bytes: record.size_bytes,
                attempts: 0,
            });
        }

        let key = state
            .index
            .storage_key(id)
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.layout.content_key(id));
        let bytes = serde_json::to_vec(record)?;

        eviction.enforce_budget(store, &mut state.index, metrics, Some(id), record.size_bytes)?;
        let write = RecordWrite {
            key: &key,
            expected,
            bytes: &bytes,
        };
        if eviction.write(store, &mut state.index, metrics, Some(id), write)?.is_none() {
            return Ok(false);
        }
        state.index.replace(id, &key, record.category.as_deref(), record.size_bytes)?;
        Ok(true)
    }

    /// Read-modify-write `id` against the shared store, then persist and
    /// notify other tabs.
    ///
    /// `apply` maps the stored record to the one to write (`None` writes
    /// nothing) plus a value handed back to the caller. When another writer
    /// changes the record between the read and the write, `apply` runs
    /// again on a fresh read, so its decision is always made against what
    /// it overwrites.
    fn commit<T>(
        &self,
        state: &mut EngineState,
        id: &str,
        mut apply: impl FnMut(Option<CacheRecord>) -> Result<(Option<CacheRecord>, T)>,
    ) -> Result<(Option<CacheRecord>, T)> {
        let mut attempt: u32 = 0;
        loop {
            let (current, expected) = self.read_for_write(state, id)?;
            let (next, value) = apply(current)?;
            let Some(record) = next else {
                return Ok((None, value));
            };
            if self.write_record(state, &record, expected.as_deref())? {
                self.persist(state).or_else(degraded)?;
                self.publish(self.inner.layout.content_key(&record.id), Some(record.version));
                return Ok((Some(record), value));
            }
            attempt += 1;
            debug!(id, attempt, "Record changed by another writer, re-resolving");
        }
    }

    /// Best-effort access bookkeeping write. Skipped when the record changed
    /// since `stored` was read; failure only loses the counter.
    fn write_back(&self, stored: &StoredRecord, record: &CacheRecord) {
        let result = serde_json::to_vec(record)
            .map_err(CacheError::from)
            .and_then(|bytes| {
                self.inner
                    .store
                    .set_if(&stored.key, Some(&stored.bytes), &bytes)
                    .map_err(CacheError::from)
            });
        match result {
            Ok(true) => {}
            Ok(false) => debug!(id = %record.id, "Record changed since read, access not recorded"),
            Err(e) => debug!(id = %record.id, error = %e, "Could not record access"),
        }
    }

    fn metadata_of(&self, state: &EngineState) -> CacheMetadata {
        CacheMetadata {
            total_items: state.index.len() as u64,
            total_size_bytes: state.index.total_size_bytes(),
            last_cleanup_at: state.last_cleanup_at,
            stats: self.inner.metrics.snapshot(),
        }
    }

    /// Write index and metadata, evicting if the store is out of room.
    fn persist(&self, state: &mut EngineState) -> Result<()> {
        let store = self.inner.store.as_ref();
        let index_key = self.inner.layout.index_key();
        let metadata_key = self.inner.layout.metadata_key();
        let attempts = self.inner.config.eviction_attempts.max(1);

        let mut size_bytes = 0;
        for attempt in 1..=attempts {
            let index_bytes = serde_json::to_vec(&state.index)?;
            let metadata_bytes = serde_json::to_vec(&self.metadata_of(state))?;
            size_bytes = (index_bytes.len() + metadata_bytes.len()) as u64;

            let written = store
                .set(&index_key, &index_bytes)
                .and_then(|()| store.set(&metadata_key, &metadata_bytes));
            match written {
                Ok(()) => return Ok(()),
                Err(e) if e.is_quota_exceeded() => {
                    let evicted = self.inner.eviction.evict_one(
                        store,
                        &mut state.index,
                        &self.inner.metrics,
                        None,
                    )?;
                    if evicted.is_none() {
                        break;
                    }
                    debug!(attempt, "Evicted a record to make room for the index");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CacheError::StorageFull {
            id: index_key,
            size_bytes,
            attempts,
        })
    }

    /// Load the persisted index, rebuilding it from stored records when it
    /// is missing or unusable. The flag reports a rebuild.
    fn load_index(&self) -> Result<(CacheIndex, bool)> {
        let store = self.inner.store.as_ref();
        if let Some(bytes) = store.get(&self.inner.layout.index_key())? {
            match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => match index.check_invariants() {
                    Ok(()) => return Ok((index, false)),
                    Err(e) => warn!(error = %e, "Stored index is inconsistent, rebuilding"),
                },
                Err(e) => warn!(error = %e, "Stored index is unreadable, rebuilding"),
            }
        }
        Ok((self.rebuild_index()?, true))
    }

    fn rebuild_index(&self) -> Result<CacheIndex> {
        let store = self.inner.store.as_ref();
        let layout = &self.inner.layout;

        let mut found = Vec::new();
        for key in store.keys(&layout.content_prefix())? {
            let Some(id) = layout.id_from_content_key(&key) else {
                continue;
            };
            let Some(bytes) = store.get(&key)? else {
                continue;
            };
            match guard::inspect(&bytes, id) {
                Ok(record) => found.push((record.last_accessed_at, key.clone(), record)),
                Err(reason) => {
                    warn!(key = %key, reason = %reason, "Quarantining corrupt record during rebuild");
                    store.delete(&key)?;
                    self.inner.metrics.record_corruption(id);
                }
            }
        }

        // Oldest access first so the rebuilt LRU order is meaningful
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.id.cmp(&b.2.id)));

        let mut index = CacheIndex::new();
        for (_, key, record) in &found {
            index.admit(&record.id, key, record.category.as_deref(), record.size_bytes)?;
        }
        if !index.is_empty() {
            info!(items = index.len(), "Rebuilt cache index from stored records");
        }
        Ok(index)
    }

    fn publish(&self, key: String, new_version: Option<u64>) {
        if let Some(bus) = &self.inner.bus {
            bus.publish(ChangeNotice {
                key,
                new_version,
                origin: self.inner.tab.clone(),
            });
        }
    }

    fn track(&self, task: AbortHandle) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Retry failed keys with backoff until the engine is fresh again.
async fn retry_loop(weak: Weak<Inner>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let cache = ContentCache { inner };

        let keys: Vec<String> = std::mem::take(&mut cache.lock().retry_keys).into_iter().collect();
        debug!(keys = keys.len(), "Retrying origin fetches");
        for key in &keys {
            if let Err(e) = cache.get(key).await {
                warn!(id = %key, error = %e, "Retry failed");
            }
        }

        let next = {
            let mut state = cache.lock();
            let next = match state.fallback.mode() {
                SyncMode::Fresh => None,
                _ if state.retry_keys.is_empty() => None,
                _ => state.fallback.next_retry_delay(),
            };
            if next.is_none() {
                state.retry_keys.clear();
                state.retry_scheduled = false;
            }
            next
        };
        match next {
            Some(next) => delay = next,
            None => return,
        }
    }
}

fn load_metadata(store: &dyn Storage, layout: &KeyLayout) -> Result<CacheMetadata> {
    match store.get(&layout.metadata_key())? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(error = %e, "Stored metadata is unreadable, starting from zero");
            CacheMetadata::default()
        })),
        None => Ok(CacheMetadata::default()),
    }
}

/// Running out of room while persisting bookkeeping is a degraded state,
/// not a failure of the operation.
fn degraded(e: CacheError) -> Result<()> {
    match e {
        CacheError::StorageFull { .. } => {
            warn!(error = %e, "Cache storage full, continuing degraded");
            Ok(())
        }
        other => Err(other),
    }
}
