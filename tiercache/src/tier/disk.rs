//! Disk Tier
//!
//! Persistent, byte-bounded cache backed by a single SQLite table.
//! Each call opens no transaction beyond its own statements; size accounting
//! uses `SUM(size)` and is approximate when several writers share the file.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{CacheLevel, CacheTier, TierResult, TierWrite};
use crate::clock::SharedClock;
use crate::entry::{CacheEntry, CacheValue, Priority};
use crate::error::{CacheError, CodecError, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        last_accessed INTEGER NOT NULL,
        access_count INTEGER NOT NULL,
        ttl INTEGER,
        priority INTEGER NOT NULL,
        size INTEGER NOT NULL,
        tags TEXT NOT NULL,
        metadata TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_last_accessed ON cache_entries(last_accessed);
    CREATE INDEX IF NOT EXISTS idx_created_at ON cache_entries(created_at);
";

/// Raw column values of one row
struct Row {
    key: String,
    value: Vec<u8>,
    created_at: i64,
    last_accessed: i64,
    access_count: i64,
    ttl: Option<i64>,
    priority: i64,
    size: i64,
    tags: String,
    metadata: String,
}

impl Row {
    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            created_at: row.get(2)?,
            last_accessed: row.get(3)?,
            access_count: row.get(4)?,
            ttl: row.get(5)?,
            priority: row.get(6)?,
            size: row.get(7)?,
            tags: row.get(8)?,
            metadata: row.get(9)?,
        })
    }

    fn into_entry(self) -> std::result::Result<CacheEntry, CodecError> {
        let timestamp = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| CodecError::Decode(format!("invalid timestamp {}", ms)))
        };
        let tags: BTreeSet<String> = serde_json::from_str(&self.tags)
            .map_err(|e| CodecError::Decode(format!("tags: {}", e)))?;
        let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| CodecError::Decode(format!("metadata: {}", e)))?;
        let priority = Priority::from_level(self.priority)
            .ok_or_else(|| CodecError::Decode(format!("priority {}", self.priority)))?;

        Ok(CacheEntry {
            value: CacheValue::from_bytes(&self.value)?,
            created_at: timestamp(self.created_at)?,
            last_accessed: timestamp(self.last_accessed)?,
            access_count: self.access_count.max(0) as u64,
            ttl: self.ttl.map(|t| t.max(0) as u64),
            priority,
            size: self.size.max(0) as usize,
            tags,
            metadata,
            key: self.key,
        })
    }
}

const SELECT_ROW: &str = "SELECT key, value, created_at, last_accessed, access_count, ttl, \
                          priority, size, tags, metadata FROM cache_entries WHERE key = ?1";

/// SQLite-backed tier bounded by total payload bytes
pub struct DiskTier {
    conn: Mutex<Connection>,
    path: PathBuf,
    max_size_bytes: u64,
    clock: SharedClock,
}

impl DiskTier {
    /// Open (or create) the cache database at `path`
    pub fn open(path: impl AsRef<Path>, max_size_mb: u64, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        info!(
            "Disk cache opened at {} (journal={}, budget={}MB)",
            path.display(),
            mode,
            max_size_mb
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            max_size_bytes: max_size_mb.saturating_mul(1024 * 1024),
            clock,
        })
    }

    /// Same as [`DiskTier::open`] with an explicit byte budget
    pub fn with_byte_budget(
        path: impl AsRef<Path>,
        max_size_bytes: u64,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut tier = Self::open(path, 0, clock)?;
        tier.max_size_bytes = max_size_bytes;
        Ok(tier)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn total_size(conn: &Connection) -> Result<u64> {
        let total: Option<i64> =
            conn.query_row("SELECT SUM(size) FROM cache_entries", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
        Ok(conn.execute(
            "DELETE FROM cache_entries WHERE ttl IS NOT NULL AND (?1 - created_at) > ttl * 1000",
            params![now.timestamp_millis()],
        )?)
    }

    /// Expired rows first, then the least recently accessed quarter
    fn cleanup(conn: &Connection, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let expired = Self::delete_expired(conn, now)?;

        let remaining: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        let quarter = remaining / 4;
        let stale = if quarter > 0 {
            conn.execute(
                "DELETE FROM cache_entries WHERE key IN (
                    SELECT key FROM cache_entries ORDER BY last_accessed ASC LIMIT ?1
                )",
                params![quarter],
            )?
        } else {
            0
        };

        Ok((expired, stale))
    }

    fn read_entry(conn: &Connection, key: &str) -> Result<Option<CacheEntry>> {
        let row = conn
            .query_row(SELECT_ROW, params![key], Row::from_sql)
            .optional()?;

        match row {
            Some(row) => match row.into_entry() {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!("Dropping undecodable disk cache row {}: {}", key, e);
                    conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn try_get(&self, key: &str, record_access: bool) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        let conn = self.conn.lock();

        let Some(mut entry) = Self::read_entry(&conn, key)? else {
            return Ok(None);
        };

        if !record_access {
            return Ok(Some(entry));
        }

        if entry.is_expired_at(now) {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            debug!("Disk cache expired on access: {}", key);
            return Ok(None);
        }

        entry.update_access_at(now);
        conn.execute(
            "UPDATE cache_entries SET last_accessed = ?1, access_count = ?2 WHERE key = ?3",
            params![
                entry.last_accessed.timestamp_millis(),
                entry.access_count as i64,
                key
            ],
        )?;

        Ok(Some(entry))
    }

    fn try_put(&self, entry: &CacheEntry) -> Result<()> {
        let now = self.clock.now();
        let blob = entry.value.to_bytes()?;
        let tags = serde_json::to_string(&entry.tags)?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        let conn = self.conn.lock();

        let current = Self::total_size(&conn)?;
        if current + entry.size as u64 > self.max_size_bytes {
            let (expired, stale) = Self::cleanup(&conn, now)?;
            info!(
                "Disk cache over budget ({} + {} > {} bytes): removed {} expired, {} stale",
                current, entry.size, self.max_size_bytes, expired, stale
            );
        }

        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
                (key, value, created_at, last_accessed, access_count,
                 ttl, priority, size, tags, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.key,
                blob,
                entry.created_at.timestamp_millis(),
                entry.last_accessed.timestamp_millis(),
                entry.access_count as i64,
                entry.ttl.map(|t| i64::try_from(t).unwrap_or(i64::MAX)),
                entry.priority.level(),
                entry.size as i64,
                tags,
                metadata,
            ],
        )?;

        Ok(())
    }

    fn try_remove(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])? > 0)
    }

    fn try_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM cache_entries")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn try_remove_tagged(&self, tags: &BTreeSet<String>) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = {
            let mut stmt = conn.prepare("SELECT key, tags FROM cache_entries")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut removed = 0;
        for (key, raw_tags) in rows {
            let matches = match serde_json::from_str::<BTreeSet<String>>(&raw_tags) {
                Ok(row_tags) => !row_tags.is_disjoint(tags),
                Err(e) => {
                    warn!("Unreadable tags on disk cache row {}: {}", key, e);
                    false
                }
            };
            if matches {
                removed += conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            }
        }
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    fn report<T>(&self, operation: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Disk cache {} failed ({}): {}", operation, self.path.display(), e);
                None
            }
        }
    }
}

impl CacheTier for DiskTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::Disk
    }

    fn get(&self, key: &str) -> TierResult<CacheEntry> {
        match self.report("get", self.try_get(key, true)) {
            Some(Some(entry)) => TierResult::Hit(entry),
            Some(None) => TierResult::Miss,
            None => TierResult::Unavailable,
        }
    }

    fn peek(&self, key: &str) -> TierResult<CacheEntry> {
        match self.report("peek", self.try_get(key, false)) {
            Some(Some(entry)) => TierResult::Hit(entry),
            Some(None) => TierResult::Miss,
            None => TierResult::Unavailable,
        }
    }

    fn put(&self, entry: &CacheEntry) -> TierWrite {
        match self.try_put(entry) {
            Ok(()) => TierWrite::Stored,
            Err(CacheError::Codec(e)) => {
                error!("Disk cache cannot encode {}: {}", entry.key, e);
                TierWrite::Rejected
            }
            Err(e) => {
                error!("Disk cache put failed ({}): {}", self.path.display(), e);
                TierWrite::Unavailable
            }
        }
    }

    fn remove(&self, key: &str) -> TierResult<()> {
        match self.report("remove", self.try_remove(key)) {
            Some(true) => TierResult::Hit(()),
            Some(false) => TierResult::Miss,
            None => TierResult::Unavailable,
        }
    }

    fn clear(&self) -> bool {
        let result = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries", [])
            .map_err(CacheError::from);
        self.report("clear", result).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.report("keys", self.try_keys()).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.report("count", self.count()).unwrap_or(0)
    }

    fn byte_size(&self) -> usize {
        let result = Self::total_size(&self.conn.lock());
        self.report("size", result).unwrap_or(0) as usize
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let result = Self::delete_expired(&self.conn.lock(), now);
        self.report("purge", result).unwrap_or(0)
    }

    fn remove_tagged(&self, tags: &BTreeSet<String>) -> usize {
        self.report("tag invalidation", self.try_remove_tagged(tags))
            .unwrap_or(0)
    }

    fn compact(&self) {
        let result = self
            .conn
            .lock()
            .execute_batch("PRAGMA optimize;")
            .map_err(CacheError::from);
        self.report("optimize", result);
    }
}
