//! tabcache CLI - drive a file-backed content cache from the command line.
//!
//! The cache lives under the user's cache directory (or `--store-dir`) and
//! is shared by every invocation, so a read that fails against the origin
//! is answered from whatever an earlier invocation stored.

mod cli;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tabcache_core::{
    expiry, CacheRecord, ContentCache, ContentFetcher, EngineConfig, FileStore, HttpOrigin,
    Lookup, OriginError, OriginItem,
};

use cli::{Cli, Commands};

/// Name of the rolling log file inside `--log-dir`
const LOG_FILE_PREFIX: &str = "tabcache.log";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard must
/// live until exit so buffered file output is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Origin used when none is configured: every fetch fails, so reads are
/// served from the cache.
struct NoOrigin;

#[async_trait]
impl ContentFetcher for NoOrigin {
    async fn fetch(&self, _key: &str) -> Result<OriginItem, OriginError> {
        Err(OriginError::Network("no origin configured".to_string()))
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = cli.config.clone().or_else(EngineConfig::default_path);
    let mut config = match path {
        Some(ref path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(ref namespace) = cli.namespace {
        config = config.with_namespace(namespace.clone());
    }
    if let Some(ms) = cli.timeout_ms {
        config = config.with_fetch_timeout(Duration::from_millis(ms));
    }
    // One-shot process: nothing would be around to run background retries
    config.retry.enabled = false;
    Ok(config)
}

fn open_cache(cli: &Cli) -> Result<ContentCache> {
    let config = load_config(cli)?;

    let dir = match cli.store_dir.clone().or_else(FileStore::default_dir) {
        Some(dir) => dir,
        None => anyhow::bail!("Could not determine a cache directory; pass --store-dir"),
    };
    let store = FileStore::new(&dir)
        .with_context(|| format!("Failed to open cache directory {}", dir.display()))?;

    let origin: Arc<dyn ContentFetcher> = match cli.origin {
        Some(ref url) => {
            let client = HttpOrigin::new(url).with_context(|| format!("Invalid origin URL {}", url))?;
            match cli.token {
                Some(ref token) => Arc::new(client.with_token(Arc::new(token.clone()))),
                None => Arc::new(client),
            }
        }
        None => {
            debug!("No origin configured, serving from cache only");
            Arc::new(NoOrigin)
        }
    };

    info!(store = %dir.display(), namespace = %config.namespace, "Opening cache");
    ContentCache::builder(Arc::new(store), origin)
        .config(config)
        .init()
        .context("Failed to initialise cache")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordSummary<'a> {
    id: &'a str,
    category: Option<&'a str>,
    content_type: &'a str,
    version: u64,
    size_bytes: u64,
    access_count: u64,
    age: String,
    fresh: bool,
    pending: bool,
}

impl<'a> RecordSummary<'a> {
    fn new(record: &'a CacheRecord) -> Self {
        let now = Utc::now();
        Self {
            id: &record.id,
            category: record.category.as_deref(),
            content_type: record.content_type.as_str(),
            version: record.version,
            size_bytes: record.size_bytes,
            access_count: record.access_count,
            age: record.age_display(now),
            fresh: expiry::status(record, now).is_fresh(),
            pending: record.pending,
        }
    }
}

async fn run(cache: &ContentCache, command: Commands) -> Result<Value> {
    let output = match command {
        Commands::Get { key } => {
            let lookup = cache.get(&key).await?;
            let status = cache.sync_status();
            match lookup {
                Lookup::Hit { record, source } => json!({
                    "key": key,
                    "source": source,
                    "age": record.age_display(Utc::now()),
                    "record": record,
                    "syncStatus": status,
                }),
                Lookup::Missing => json!({
                    "key": key,
                    "missing": true,
                    "syncStatus": status,
                }),
            }
        }
        Commands::Category { name } => {
            let records = cache.get_by_category(&name)?;
            json!({ "category": name, "records": records })
        }
        Commands::Status => {
            let mut records = Vec::new();
            for id in cache.cached_ids()? {
                if let Some(record) = cache.peek(&id)? {
                    records.push(record);
                }
            }
            let summaries: Vec<RecordSummary<'_>> = records.iter().map(RecordSummary::new).collect();
            json!({
                "namespace": cache.config().namespace,
                "syncStatus": cache.sync_status(),
                "metadata": cache.metadata()?,
                "records": summaries,
            })
        }
        Commands::Invalidate { id } => {
            let invalidated = cache.invalidate(&id)?;
            json!({ "id": id, "invalidated": invalidated })
        }
        Commands::Maintain => serde_json::to_value(cache.maintain()?)?,
        Commands::Stats => {
            let stats = cache.stats();
            json!({ "stats": stats, "hitRate": stats.hit_rate() })
        }
        Commands::Reset => {
            cache.reset()?;
            json!({ "reset": true })
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let cache = open_cache(&cli)?;
    let pretty = cli.pretty;
    let output = run(&cache, cli.command).await?;
    cache.teardown().context("Failed to flush cache index")?;

    let rendered = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);
    Ok(())
}
