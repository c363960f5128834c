//! Cache tiers
//!
//! Provides the storage levels the orchestrator composes:
//! - Memory: bounded in-process store (LRU or LFU eviction)
//! - Remote: Redis-protocol key-value store with native TTL
//! - Disk: SQLite table bounded by total payload bytes
//!
//! Tier operations never return errors. Failures are logged by the tier and
//! surface as [`TierResult::Unavailable`] / [`TierWrite::Unavailable`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::entry::CacheEntry;

pub mod disk;
pub mod lfu;
pub mod lru;
pub mod remote;

pub use disk::DiskTier;
pub use lfu::LfuTier;
pub use lru::LruTier;
pub use remote::{MemoryBackend, RedisBackend, RemoteBackend, RemoteTier};

/// Storage level of a tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    Memory,
    Remote,
    Disk,
}

impl CacheLevel {
    /// Lower is faster; promotion copies toward lower ranks
    pub fn rank(self) -> u8 {
        match self {
            Self::Memory => 0,
            Self::Remote => 1,
            Self::Disk => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Remote => "remote",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a tier read
#[derive(Debug, Clone, PartialEq)]
pub enum TierResult<T> {
    Hit(T),
    Miss,
    Unavailable,
}

impl<T> TierResult<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Unavailable => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Hit(_) => "hit",
            Self::Miss => "miss",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Outcome of a tier write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierWrite {
    Stored,
    Rejected,
    Unavailable,
}

impl TierWrite {
    pub fn is_stored(self) -> bool {
        self == Self::Stored
    }

    pub fn status(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Point-in-time view of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub level: CacheLevel,
    pub available: bool,
    pub entries: usize,
    pub bytes: usize,
    pub capacity_evictions: u64,
}

/// One storage level of the cache hierarchy.
///
/// Implementations guard their own state with a single lock and must never
/// call back into another tier.
pub trait CacheTier: Send + Sync {
    fn level(&self) -> CacheLevel;

    /// Read an entry, recording the access. Expired entries are removed and reported as a miss.
    fn get(&self, key: &str) -> TierResult<CacheEntry>;

    /// Read an entry without recording the access
    fn peek(&self, key: &str) -> TierResult<CacheEntry>;

    /// Insert or replace
    fn put(&self, entry: &CacheEntry) -> TierWrite;

    /// `Hit(())` if the key was present
    fn remove(&self, key: &str) -> TierResult<()>;

    fn clear(&self) -> bool;

    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Approximate bytes held (sum of entry sizes)
    fn byte_size(&self) -> usize;

    /// Entries dropped to satisfy the tier's capacity bound
    fn capacity_evictions(&self) -> u64 {
        0
    }

    /// Remove every expired entry; returns how many were removed
    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for key in self.keys() {
            if let TierResult::Hit(entry) = self.peek(&key) {
                if entry.is_expired_at(now) && self.remove(&key).is_hit() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Remove every entry carrying at least one of `tags`
    fn remove_tagged(&self, tags: &BTreeSet<String>) -> usize {
        let mut removed = 0;
        for key in self.keys() {
            if let TierResult::Hit(entry) = self.peek(&key) {
                if entry.has_any_tag(tags) && self.remove(&key).is_hit() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Release spare capacity held by internal structures
    fn compact(&self) {}

    fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            level: self.level(),
            available: self.is_available(),
            entries: self.len(),
            bytes: self.byte_size(),
            capacity_evictions: self.capacity_evictions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ranks_fastest_first() {
        let mut levels = vec![CacheLevel::Disk, CacheLevel::Memory, CacheLevel::Remote];
        levels.sort_by_key(|l| l.rank());
        assert_eq!(
            levels,
            vec![CacheLevel::Memory, CacheLevel::Remote, CacheLevel::Disk]
        );
    }

    #[test]
    fn test_tier_result_status() {
        assert_eq!(TierResult::Hit(1).status(), "hit");
        assert_eq!(TierResult::<u8>::Miss.hit(), None);
        assert!(!TierResult::<u8>::Unavailable.is_hit());
        assert!(TierWrite::Stored.is_stored());
    }
}
