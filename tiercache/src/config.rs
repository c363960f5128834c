use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::compression::CompressionConfig;
use crate::error::{CacheError, Result};
use crate::tier::CacheLevel;

/// Memory-tier eviction strategy.
///
/// `Lfu` selects the frequency tier; every other strategy runs on the LRU
/// tier. `Adaptive` additionally enables TTL retuning.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Lru,
    Lfu,
    Ttl,
    #[default]
    Adaptive,
    Priority,
}

impl CacheStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
            Self::Adaptive => "adaptive",
            Self::Priority => "priority",
        }
    }
}

/// Main cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,
    pub levels: Vec<CacheLevel>,
    pub max_memory_entries: usize,
    pub max_disk_size_mb: u64,
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub disk_cache_path: PathBuf,
    pub remote: RemoteConfig,
    pub adaptive: AdaptiveTuning,
    pub compression: CompressionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub prefix: String,
    pub timeout_ms: u64,
}

/// Thresholds for adaptive TTL retuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveTuning {
    /// Below this hit rate (percent) the default TTL grows
    pub low_hit_rate: f64,
    /// Above this hit rate (percent) the default TTL shrinks
    pub high_hit_rate: f64,
    pub grow_factor: f64,
    pub shrink_factor: f64,
    pub max_ttl_secs: u64,
    pub min_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Adaptive,
            levels: vec![CacheLevel::Memory, CacheLevel::Disk],
            max_memory_entries: 1000,
            max_disk_size_mb: 100,
            default_ttl_secs: 3600,
            cleanup_interval_secs: 300,
            disk_cache_path: PathBuf::from("intelligent_cache.db"),
            remote: RemoteConfig::default(),
            adaptive: AdaptiveTuning::default(),
            compression: CompressionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "cache:".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            low_hit_rate: 50.0,
            high_hit_rate: 90.0,
            grow_factor: 1.2,
            shrink_factor: 0.9,
            max_ttl_secs: 7200,
            min_ttl_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CacheConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn has_level(&self, level: CacheLevel) -> bool {
        self.levels.contains(&level)
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(CacheError::Config("at least one cache level is required".into()));
        }
        if self.max_memory_entries == 0 {
            return Err(CacheError::Config("max_memory_entries must be > 0".into()));
        }
        if self.has_level(CacheLevel::Disk) && self.max_disk_size_mb == 0 {
            return Err(CacheError::Config("max_disk_size_mb must be > 0".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(CacheError::Config("cleanup_interval_secs must be > 0".into()));
        }
        if self.has_level(CacheLevel::Remote) && self.remote.url.is_empty() {
            return Err(CacheError::Config("remote.url is required for the remote level".into()));
        }

        let tuning = &self.adaptive;
        if tuning.low_hit_rate > tuning.high_hit_rate {
            return Err(CacheError::Config(format!(
                "adaptive.low_hit_rate ({}) exceeds adaptive.high_hit_rate ({})",
                tuning.low_hit_rate, tuning.high_hit_rate
            )));
        }
        if tuning.grow_factor < 1.0 || !(0.0..=1.0).contains(&tuning.shrink_factor) {
            return Err(CacheError::Config(
                "adaptive factors must satisfy grow_factor >= 1 and 0 <= shrink_factor <= 1".into(),
            ));
        }
        if tuning.min_ttl_secs > tuning.max_ttl_secs {
            return Err(CacheError::Config(
                "adaptive.min_ttl_secs exceeds adaptive.max_ttl_secs".into(),
            ));
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(CacheError::Config(format!("unknown log format: {}", other))),
        }
    }
}
