use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::CacheStrategy;
use crate::tier::{CacheLevel, TierSnapshot};

/// Weight of the newest sample in the rolling access time
const ACCESS_TIME_ALPHA: f64 = 0.1;

/// Running counters kept by the orchestrator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by maintenance sweeps
    pub evictions: u64,
    /// Bytes accepted by `put` since the last reset
    pub total_size: u64,
    /// Exponential moving average of hit latency, in seconds
    pub avg_access_time: f64,
    sampled: bool,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage of lookups that hit, 0 when there were none
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }

    pub fn record_hit(&mut self, elapsed: Duration) {
        self.hits += 1;
        let sample = elapsed.as_secs_f64();
        if self.sampled {
            self.avg_access_time =
                (1.0 - ACCESS_TIME_ALPHA) * self.avg_access_time + ACCESS_TIME_ALPHA * sample;
        } else {
            self.avg_access_time = sample;
            self.sampled = true;
        }
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_insert(&mut self, size: usize) {
        self.total_size += size as u64;
    }

    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Snapshot returned by `IntelligentCache::get_stats`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsReport {
    pub hits: u64,
    pub misses: u64,
    /// Percent, rounded to two decimals
    pub hit_rate: f64,
    pub evictions: u64,
    /// Sum of entries held by every tier
    pub entry_count: usize,
    pub total_size: u64,
    pub avg_access_time_ms: f64,
    /// Bytes held by the memory tier
    pub memory_usage: usize,
    pub strategy: CacheStrategy,
    pub levels: Vec<CacheLevel>,
    pub default_ttl_secs: u64,
    pub cache_sizes_per_tier: BTreeMap<CacheLevel, usize>,
    pub tiers: Vec<TierSnapshot>,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit(Duration::ZERO);
        stats.record_hit(Duration::ZERO);
        stats.record_miss();
        assert!((stats.hit_rate() - 66.666).abs() < 0.01);
        assert_eq!(round2(stats.hit_rate()), 66.67);
    }

    #[test]
    fn test_access_time_moving_average() {
        let mut stats = CacheStats::new();
        stats.record_hit(Duration::from_millis(10));
        assert!((stats.avg_access_time - 0.010).abs() < 1e-9);

        stats.record_hit(Duration::from_millis(20));
        // 0.9 * 10ms + 0.1 * 20ms
        assert!((stats.avg_access_time - 0.011).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut stats = CacheStats::new();
        stats.record_insert(64);
        stats.record_evictions(3);
        stats.reset();
        assert_eq!(stats, CacheStats::default());
    }
}
