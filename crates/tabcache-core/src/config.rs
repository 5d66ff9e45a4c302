//! Engine configuration.
//!
//! Configuration is plain serde data. The CLI keeps it at
//! `~/.config/tabcache/config.json`; embedders usually build it in code with
//! the `with_*` setters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tabcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Records stay fresh for a day unless the embedder says otherwise.
const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest freshness window honoured, about a century.
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Origin fetch deadline.
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5000;

/// Browser local storage typically allows about 5MB per origin.
const DEFAULT_MAX_SIZE_BYTES: u64 = 5 * 1024 * 1024;

const DEFAULT_MAX_ITEMS: usize = 500;

/// Evict-and-retry rounds before a write gives up with `StorageFull`.
const DEFAULT_EVICTION_ATTEMPTS: u32 = 8;

const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive failures after which the delay pins at `max_delay_ms`
    pub circuit_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            circuit_threshold: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        if failures >= self.circuit_threshold {
            return max;
        }
        let exponent = failures.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        if !millis.is_finite() || millis >= self.max_delay_ms as f64 {
            max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Prefix for every storage key the engine owns
    pub namespace: String,
    pub default_ttl_secs: u64,
    pub fetch_timeout_ms: u64,
    pub max_items: usize,
    pub max_size_bytes: u64,
    pub eviction_attempts: u32,
    pub maintenance_interval_secs: u64,
    /// Serve expired records when the origin is unreachable
    pub serve_stale_on_error: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: APP_NAME.to_string(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_items: DEFAULT_MAX_ITEMS,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            eviction_attempts: DEFAULT_EVICTION_ATTEMPTS,
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
            serve_stale_on_error: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, contents)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_items(mut self, max: usize) -> Self {
        self.max_items = max;
        self
    }

    pub fn with_max_size_bytes(mut self, max: u64) -> Self {
        self.max_size_bytes = max;
        self
    }

    pub fn with_eviction_attempts(mut self, attempts: u32) -> Self {
        self.eviction_attempts = attempts;
        self
    }

    pub fn with_stale_serving(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Freshness window for new records, capped at `MAX_TTL_SECS`.
    pub fn ttl(&self) -> chrono::Duration {
        let secs = self.default_ttl_secs.min(MAX_TTL_SECS) as i64;
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}
