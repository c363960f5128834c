//! tiercache maintenance tool
//!
//! Opens the tiers described by a cache config file and inspects or
//! maintains them without running an application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tiercache::{CacheConfig, IntelligentCache, logging};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tiercache-cli")]
#[command(
    about = "Inspect and maintain tiercache memory, remote and disk tiers",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Cache configuration file (YAML)
    #[arg(short, long, default_value = "tiercache.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache statistics
    Stats {
        /// Print Prometheus text exposition instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Run one maintenance cycle (expiration sweep, adaptive TTL, compaction)
    Sweep,

    /// Remove entries by tag, or everything
    Purge {
        /// Tag to invalidate (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Required to remove every entry when no tag is given
        #[arg(short, long)]
        force: bool,
    },

    /// Show the stored metadata of one entry
    Inspect {
        key: String,
    },

    /// List keys held by any tier
    Keys,
}

fn load_config(path: &PathBuf) -> Result<CacheConfig> {
    if path.exists() {
        CacheConfig::from_file(path)
    } else {
        warn!("Config file {} not found, using defaults", path.display());
        Ok(CacheConfig::default())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    logging::init(&config.logging);

    let cache = IntelligentCache::builder(config)
        .without_worker()
        .build()
        .context("Failed to open cache tiers")?;

    match cli.command {
        Commands::Stats { prometheus } => {
            let stats = cache.get_stats();
            if prometheus {
                let text = tiercache::metrics::encode()
                    .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
                print!("{}", text);
            } else {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }

        Commands::Sweep => {
            let report = cache.run_maintenance();
            info!("Maintenance removed {} expired entries", report.expired);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Purge { tags, force } => {
            if tags.is_empty() {
                if !force {
                    warn!("This will remove every entry from every tier.");
                    warn!("Use --force to confirm, or --tag to purge selectively.");
                    return Ok(());
                }
                let removed = cache.clear(None);
                info!("Purged {} entries", removed);
            } else {
                let removed = cache.clear(Some(tags.as_slice()));
                info!("Purged {} entries tagged {:?}", removed, tags);
            }
        }

        Commands::Inspect { key } => match cache.inspect(&key) {
            Some((level, entry)) => {
                let view = json!({
                    "key": entry.key,
                    "tier": level,
                    "type": entry.value.type_tag,
                    "compression": entry.value.compression,
                    "created_at": entry.created_at,
                    "last_accessed": entry.last_accessed,
                    "access_count": entry.access_count,
                    "ttl": entry.ttl,
                    "priority": entry.priority,
                    "size": entry.size,
                    "tags": entry.tags,
                    "metadata": entry.metadata,
                });
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
            None => anyhow::bail!("Key not found: {}", key),
        },

        Commands::Keys => {
            for key in cache.keys() {
                println!("{}", key);
            }
        }
    }

    cache.shutdown();
    Ok(())
}
