//! Multi-tier cache orchestrator
//!
//! Composes the configured tiers fastest first:
//! - Reads scan tiers in order and promote a hit into every faster tier
//! - Writes go to every tier
//! - A background ticker sweeps expired entries and retunes the default TTL
//!   when the strategy is `adaptive`

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::{SharedClock, system_clock};
use crate::compression::Compressor;
use crate::config::{CacheConfig, CacheStrategy};
use crate::entry::{CacheEntry, CacheValue, MAX_TTL_SECS, Priority};
use crate::error::Result;
use crate::metrics;
use crate::stats::{CacheStats, CacheStatsReport, round2};
use crate::tier::{
    CacheLevel, CacheTier, DiskTier, LfuTier, LruTier, RemoteBackend, RemoteTier, TierResult,
    TierSnapshot,
};

pub mod worker;

pub use worker::Ticker;

/// Bound on how long `shutdown` waits for the cleanup thread
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call options for [`IntelligentCache::put`]
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Seconds to live; `None` or `0` uses the cache's current default TTL.
    /// Values above [`MAX_TTL_SECS`] store without expiry.
    pub ttl: Option<u64>,
    /// Store without expiry, ignoring `ttl`
    pub persistent: bool,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = Some(secs);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome of one maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    /// Expired entries removed across all tiers
    pub expired: usize,
    pub ttl_before: u64,
    pub ttl_after: u64,
    pub hit_rate: f64,
}

impl MaintenanceReport {
    pub fn ttl_changed(&self) -> bool {
        self.ttl_before != self.ttl_after
    }
}

struct CacheInner {
    config: CacheConfig,
    /// Sorted fastest first
    tiers: Vec<Box<dyn CacheTier>>,
    compressor: Compressor,
    clock: SharedClock,
    default_ttl: AtomicU64,
    stats: Mutex<CacheStats>,
    worker: Mutex<Option<Ticker>>,
}

/// Handle to a multi-tier cache.
///
/// Cheap to clone; all clones share the same tiers and statistics. The
/// cleanup worker stops on [`shutdown`](Self::shutdown) or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct IntelligentCache {
    inner: Arc<CacheInner>,
}

/// Builder for [`IntelligentCache`] with injectable clock and remote backend
pub struct CacheBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    remote_backend: Option<Box<dyn RemoteBackend>>,
    spawn_worker: bool,
}

impl CacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: None,
            remote_backend: None,
            spawn_worker: true,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `backend` for the remote level instead of connecting to `remote.url`
    pub fn remote_backend(mut self, backend: Box<dyn RemoteBackend>) -> Self {
        self.remote_backend = Some(backend);
        self
    }

    /// Do not start the cleanup thread; maintenance runs only when called
    pub fn without_worker(mut self) -> Self {
        self.spawn_worker = false;
        self
    }

    pub fn build(self) -> Result<IntelligentCache> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let config = self.config;

        let mut levels = config.levels.clone();
        levels.sort_by_key(|l| l.rank());
        levels.dedup();

        let mut remote_backend = self.remote_backend;
        let mut tiers: Vec<Box<dyn CacheTier>> = Vec::with_capacity(levels.len());
        for level in levels {
            match level {
                CacheLevel::Memory => {
                    let tier: Box<dyn CacheTier> = match config.strategy {
                        CacheStrategy::Lfu => {
                            Box::new(LfuTier::new(config.max_memory_entries, clock.clone()))
                        }
                        _ => Box::new(LruTier::new(config.max_memory_entries, clock.clone())),
                    };
                    tiers.push(tier);
                }
                CacheLevel::Remote => {
                    let tier = match remote_backend.take() {
                        Some(backend) => {
                            RemoteTier::new(backend, config.remote.prefix.clone(), clock.clone())
                        }
                        None => RemoteTier::connect(&config.remote, clock.clone()),
                    };
                    tiers.push(Box::new(tier));
                }
                CacheLevel::Disk => {
                    match DiskTier::open(
                        &config.disk_cache_path,
                        config.max_disk_size_mb,
                        clock.clone(),
                    ) {
                        Ok(tier) => tiers.push(Box::new(tier)),
                        Err(e) => error!(
                            "Disk cache at {} disabled: {}",
                            config.disk_cache_path.display(),
                            e
                        ),
                    }
                }
            }
        }

        let interval = Duration::from_secs(config.cleanup_interval_secs);
        let inner = Arc::new(CacheInner {
            compressor: Compressor::new(config.compression.clone()),
            default_ttl: AtomicU64::new(config.default_ttl_secs),
            stats: Mutex::new(CacheStats::new()),
            worker: Mutex::new(None),
            tiers,
            clock,
            config,
        });

        if self.spawn_worker {
            let weak: Weak<CacheInner> = Arc::downgrade(&inner);
            let ticker = Ticker::spawn("tiercache-cleanup", interval, move || {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.run_maintenance();
                        true
                    }
                    None => false,
                }
            })?;
            *inner.worker.lock() = Some(ticker);
        }

        info!(
            "Intelligent cache initialized (strategy={}, levels=[{}])",
            inner.config.strategy.as_str(),
            inner
                .tiers
                .iter()
                .map(|t| t.level().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(IntelligentCache { inner })
    }
}

impl IntelligentCache {
    /// Open every configured tier and start the cleanup worker
    pub fn init(config: CacheConfig) -> Result<Self> {
        CacheBuilder::new(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheBuilder {
        CacheBuilder::new(config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Levels actually in use, fastest first
    pub fn levels(&self) -> Vec<CacheLevel> {
        self.inner.levels()
    }

    /// Current default TTL in seconds (moves under the adaptive strategy)
    pub fn default_ttl_secs(&self) -> u64 {
        self.inner.default_ttl.load(Ordering::Relaxed)
    }

    /// Typed lookup, returning `default` on a miss
    pub fn get<V: DeserializeOwned>(&self, key: &str, default: V) -> V {
        self.lookup(key).unwrap_or(default)
    }

    /// Typed lookup.
    ///
    /// Scans tiers fastest first; the first hit is copied into every faster
    /// tier. A stored value of a different type counts as a miss.
    pub fn lookup<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let start = Instant::now();
        let inner = &self.inner;

        for (idx, tier) in inner.tiers.iter().enumerate() {
            let result = tier.get(key);
            metrics::record_tier_op(tier.level().as_str(), "get", result.status());

            let TierResult::Hit(entry) = result else {
                continue;
            };

            match entry.value.decode::<V>() {
                Ok(value) => {
                    inner.promote(&entry, idx);
                    let elapsed = start.elapsed();
                    inner.stats.lock().record_hit(elapsed);
                    metrics::record_op("get", "hit", elapsed.as_secs_f64());
                    debug!("Cache hit: {} (tier={})", key, tier.level());
                    return Some(value);
                }
                Err(e) => {
                    warn!("Cache entry {} unreadable as requested type: {}", key, e);
                    break;
                }
            }
        }

        inner.stats.lock().record_miss();
        metrics::record_op("get", "miss", start.elapsed().as_secs_f64());
        debug!("Cache miss: {}", key);
        None
    }

    /// Entry metadata from the fastest tier holding `key`, without recording an access
    pub fn inspect(&self, key: &str) -> Option<(CacheLevel, CacheEntry)> {
        self.inner
            .tiers
            .iter()
            .find_map(|tier| tier.peek(key).hit().map(|entry| (tier.level(), entry)))
    }

    /// Store `value` in every tier; true if at least one tier accepted it
    pub fn put<V: Serialize + ?Sized>(&self, key: &str, value: &V, options: PutOptions) -> bool {
        let start = Instant::now();
        let inner = &self.inner;

        let (value, size) = match CacheValue::encode(value, &inner.compressor) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Cannot cache {}: {}", key, e);
                metrics::record_op("put", "rejected", start.elapsed().as_secs_f64());
                return false;
            }
        };

        let ttl = if options.persistent {
            None
        } else {
            match options.ttl {
                Some(ttl) if ttl > MAX_TTL_SECS => None,
                Some(ttl) if ttl > 0 => Some(ttl),
                _ => Some(inner.default_ttl.load(Ordering::Relaxed)),
            }
        };

        let entry = CacheEntry::new(key, value, size, inner.clock.now())
            .with_ttl(ttl)
            .with_priority(options.priority)
            .with_tags(options.tags)
            .with_metadata(options.metadata);

        let mut stored = false;
        for tier in &inner.tiers {
            let status = tier.put(&entry);
            metrics::record_tier_op(tier.level().as_str(), "put", status.status());
            stored |= status.is_stored();
        }

        if stored {
            inner.stats.lock().record_insert(size);
        }
        metrics::record_op(
            "put",
            if stored { "stored" } else { "rejected" },
            start.elapsed().as_secs_f64(),
        );
        debug!("Cache put: {} (size={}, ttl={:?}, stored={})", key, size, ttl, stored);
        stored
    }

    /// Delete `key` from every tier; true if any tier held it
    pub fn remove(&self, key: &str) -> bool {
        let start = Instant::now();
        let mut removed = false;
        for tier in &self.inner.tiers {
            let result = tier.remove(key);
            metrics::record_tier_op(tier.level().as_str(), "remove", result.status());
            removed |= result.is_hit();
        }
        metrics::record_op(
            "remove",
            if removed { "hit" } else { "miss" },
            start.elapsed().as_secs_f64(),
        );
        removed
    }

    /// Invalidate entries.
    ///
    /// `None` wipes every tier and resets statistics. `Some(tags)` removes
    /// only entries carrying at least one of `tags`; an empty list removes
    /// nothing. Returns the number of entries removed across tiers.
    pub fn clear(&self, tags: Option<&[String]>) -> usize {
        let start = Instant::now();
        let inner = &self.inner;

        let removed = match tags {
            None => {
                let mut removed = 0;
                for tier in &inner.tiers {
                    removed += tier.len();
                    if !tier.clear() {
                        warn!("Failed to clear {} tier", tier.level());
                    }
                }
                inner.stats.lock().reset();
                info!("Cache cleared ({} entries)", removed);
                removed
            }
            Some(tags) => {
                let tags: BTreeSet<String> = tags.iter().cloned().collect();
                if tags.is_empty() {
                    return 0;
                }
                let removed: usize = inner.tiers.iter().map(|t| t.remove_tagged(&tags)).sum();
                info!("Cache cleared by tags {:?} ({} entries)", tags, removed);
                removed
            }
        };

        metrics::record_op("clear", "ok", start.elapsed().as_secs_f64());
        removed
    }

    /// Union of keys held by any tier
    pub fn keys(&self) -> BTreeSet<String> {
        self.inner.tiers.iter().flat_map(|t| t.keys()).collect()
    }

    pub fn tier_snapshots(&self) -> Vec<TierSnapshot> {
        self.inner.tiers.iter().map(|t| t.snapshot()).collect()
    }

    pub fn get_stats(&self) -> CacheStatsReport {
        let inner = &self.inner;
        let tiers = self.tier_snapshots();
        for snapshot in &tiers {
            metrics::set_tier_entries(snapshot.level.as_str(), snapshot.entries);
        }

        let stats = inner.stats.lock().clone();
        let memory_usage = tiers
            .iter()
            .filter(|t| t.level == CacheLevel::Memory)
            .map(|t| t.bytes)
            .sum();

        CacheStatsReport {
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: round2(stats.hit_rate()),
            evictions: stats.evictions,
            entry_count: tiers.iter().map(|t| t.entries).sum(),
            total_size: stats.total_size,
            avg_access_time_ms: stats.avg_access_time * 1000.0,
            memory_usage,
            strategy: inner.config.strategy,
            levels: inner.levels(),
            default_ttl_secs: self.default_ttl_secs(),
            cache_sizes_per_tier: tiers.iter().map(|t| (t.level, t.entries)).collect(),
            tiers,
        }
    }

    /// Run one cleanup cycle now
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.inner.run_maintenance()
    }

    /// Stop the cleanup worker; idempotent
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl CacheInner {
    fn levels(&self) -> Vec<CacheLevel> {
        self.tiers.iter().map(|t| t.level()).collect()
    }

    /// Copy `entry` into every tier faster than `hit_idx`
    fn promote(&self, entry: &CacheEntry, hit_idx: usize) {
        for tier in &self.tiers[..hit_idx] {
            let status = tier.put(entry);
            metrics::record_tier_op(tier.level().as_str(), "promote", status.status());
            if status.is_stored() {
                debug!("Promoted {} to {} tier", entry.key, tier.level());
            }
        }
    }

    fn run_maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();

        let expired: usize = self.tiers.iter().map(|t| t.purge_expired(now)).sum();

        let (hit_rate, lookups) = {
            let mut stats = self.stats.lock();
            stats.record_evictions(expired as u64);
            (stats.hit_rate(), stats.hits + stats.misses)
        };

        let ttl_before = self.default_ttl.load(Ordering::Relaxed);
        let mut ttl_after = ttl_before;
        if self.config.strategy == CacheStrategy::Adaptive && lookups > 0 {
            ttl_after = self.retuned_ttl(ttl_before, hit_rate);
            if ttl_after != ttl_before {
                self.default_ttl.store(ttl_after, Ordering::Relaxed);
                metrics::record_maintenance("ttl_adjusted", 1);
                info!(
                    "Adaptive TTL {}s -> {}s (hit rate {:.2}%)",
                    ttl_before, ttl_after, hit_rate
                );
            }
        }

        for tier in &self.tiers {
            tier.compact();
        }

        metrics::record_maintenance("cycle", 1);
        metrics::record_maintenance("expired", expired as u64);
        if expired > 0 {
            info!("Cache cleanup removed {} expired entries", expired);
        }

        MaintenanceReport {
            expired,
            ttl_before,
            ttl_after,
            hit_rate: round2(hit_rate),
        }
    }

    fn retuned_ttl(&self, ttl: u64, hit_rate: f64) -> u64 {
        let tuning = &self.config.adaptive;
        if hit_rate < tuning.low_hit_rate {
            ((ttl as f64 * tuning.grow_factor).round() as u64).min(tuning.max_ttl_secs)
        } else if hit_rate > tuning.high_hit_rate {
            ((ttl as f64 * tuning.shrink_factor).round() as u64).max(tuning.min_ttl_secs)
        } else {
            ttl
        }
    }

    fn shutdown(&self) {
        let ticker = self.worker.lock().take();
        if let Some(ticker) = ticker {
            if ticker.stop(SHUTDOWN_TIMEOUT) {
                info!("Cache cleanup worker stopped");
            }
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
