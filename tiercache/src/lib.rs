//! tiercache - intelligent multi-tier cache
//!
//! Memory (LRU/LFU), optional remote (Redis protocol) and disk (SQLite) tiers
//! behind one handle, with read-through promotion, tag invalidation,
//! background expiration and adaptive TTL.

pub mod cache;
pub mod clock;
pub mod compression;
pub mod config;
pub mod entry;
pub mod error;
pub mod logging;
pub mod memoize;
pub mod metrics;
pub mod stats;
pub mod tier;

pub use cache::{CacheBuilder, IntelligentCache, MaintenanceReport, PutOptions};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use config::{AdaptiveTuning, CacheConfig, CacheStrategy, LoggingConfig, RemoteConfig};
pub use entry::{CacheEntry, CacheValue, MAX_TTL_SECS, Priority};
pub use error::{CacheError, CodecError, Result};
pub use memoize::{Memoized, derive_key};
pub use stats::{CacheStats, CacheStatsReport};
pub use tier::{
    CacheLevel, CacheTier, DiskTier, LfuTier, LruTier, MemoryBackend, RedisBackend,
    RemoteBackend, RemoteTier, TierResult, TierSnapshot, TierWrite,
};
