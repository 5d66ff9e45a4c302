//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tabcache - inspect and drive a local content cache that keeps working
/// when the origin is unreachable.
#[derive(Parser, Debug)]
#[command(name = "tabcache")]
#[command(
    author,
    version,
    about,
    long_about = r#"tabcache keeps a local copy of origin content and serves it when the
origin is slow or unreachable.

Every command prints JSON to stdout. Logs go to stderr (RUST_LOG controls
the level) and, with --log-dir, to a daily rolling file.

Examples:
    tabcache --origin https://cms.example.com/api get home-banner
    tabcache category promo-banners
    tabcache status --pretty
    tabcache maintain
"#
)]
pub struct Cli {
    /// Base URL of the origin content service.
    #[arg(
        long,
        global = true,
        env = "TABCACHE_ORIGIN",
        value_name = "URL",
        long_help = "Base URL of the origin content service. Items are fetched from\n\
{URL}/content/{key}. Without an origin every read is served from the cache."
    )]
    pub origin: Option<String>,

    /// Bearer token sent to the origin.
    #[arg(long, global = true, env = "TABCACHE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Storage namespace (key prefix).
    #[arg(long, global = true, env = "TABCACHE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Directory holding the cache files.
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Engine configuration file (JSON).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write logs to a daily rolling file in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Override the origin fetch deadline.
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Pretty-print JSON output.
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch one item, falling back to the cache.
    Get {
        /// Item id or category-style key.
        key: String,
    },

    /// List cached, unexpired items in a category. Never contacts the origin.
    Category {
        name: String,
    },

    /// Show sync status, metadata and the cached records.
    Status,

    /// Mark a cached item as expired.
    Invalidate {
        id: String,
    },

    /// Run one maintenance pass.
    Maintain,

    /// Show hit/miss/eviction/corruption counters.
    Stats,

    /// Delete everything under the namespace.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tabcache",
            "get",
            "home-banner",
            "--timeout-ms",
            "250",
            "--pretty",
        ])
        .unwrap();
        assert_eq!(cli.timeout_ms, Some(250));
        assert!(cli.pretty);
        assert!(matches!(cli.command, Commands::Get { ref key } if key == "home-banner"));
    }
}
