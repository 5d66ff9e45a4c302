//! Hit/miss/eviction/corruption counters and the persisted metadata record.
//!
//! The recorder is write-only from the engine's point of view: nothing reads
//! the counters to make a decision.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CacheStats {
    /// Reads that served a fresh or cached record
    pub hits: u64,
    /// Reads with nothing servable
    pub misses: u64,
    /// Records removed to relieve capacity pressure or because they expired
    pub evictions: u64,
    /// Records quarantined because they failed validation
    pub corruptions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    corruptions: AtomicU64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue counting from previously persisted totals.
    pub fn seeded(stats: CacheStats) -> Self {
        Self {
            hits: AtomicU64::new(stats.hits),
            misses: AtomicU64::new(stats.misses),
            evictions: AtomicU64::new(stats.evictions),
            corruptions: AtomicU64::new(stats.corruptions),
        }
    }

    pub fn record_hit(&self, id: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(id, "cache hit");
    }

    pub fn record_miss(&self, id: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(id, "cache miss");
    }

    pub fn record_eviction(&self, id: &str) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(id, "cache eviction");
    }

    pub fn record_corruption(&self, id: &str) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
        trace!(id, "cache corruption");
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.hits, &self.misses, &self.evictions, &self.corruptions] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Aggregate bookkeeping persisted under `<namespace>_metadata`.
///
/// `total_size_bytes` may drift between writes from different tabs; the
/// maintenance pass recomputes it from the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub total_items: u64,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub last_cleanup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_recorder_counts() {
        let metrics = MetricsRecorder::new();
        metrics.record_hit("a");
        metrics.record_hit("a");
        metrics.record_miss("b");
        metrics.record_eviction("c");
        metrics.record_corruption("d");

        assert_eq!(
            metrics.snapshot(),
            CacheStats {
                hits: 2,
                misses: 1,
                evictions: 1,
                corruptions: 1
            }
        );

        metrics.reset();
        assert_eq!(metrics.snapshot(), CacheStats::default());
    }

    #[test]
    fn test_seeded_recorder_continues() {
        let metrics = MetricsRecorder::seeded(CacheStats {
            hits: 5,
            ..Default::default()
        });
        metrics.record_hit("a");
        assert_eq!(metrics.snapshot().hits, 6);
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let meta: CacheMetadata =
            serde_json::from_str(r#"{"totalItems": 2, "totalSizeBytes": 40}"#).unwrap();
        assert_eq!(meta.total_items, 2);
        assert!(meta.last_cleanup_at.is_none());
        assert_eq!(meta.stats, CacheStats::default());
    }
}
