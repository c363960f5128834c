//! Remote Tier
//!
//! Namespaced key-value tier over a Redis-protocol server. TTL enforcement is
//! delegated to the backend (`SETEX`); expiration is still checked on read in
//! case the two clocks disagree.
//!
//! A tier whose connectivity probe fails at construction stays unavailable
//! for its whole life: every operation is a silent miss / no-op.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CacheLevel, CacheTier, TierResult, TierWrite};
use crate::clock::SharedClock;
use crate::config::RemoteConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};

/// Minimal command set the remote tier needs from a key-value server
pub trait RemoteBackend: Send + Sync {
    fn ping(&self) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// `ttl_secs = None` stores without expiry
    fn set(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    /// All keys starting with `prefix`
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

impl<B: RemoteBackend + ?Sized> RemoteBackend for Arc<B> {
    fn ping(&self) -> Result<()> {
        (**self).ping()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        (**self).set(key, value, ttl_secs)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).scan_prefix(prefix)
    }
}

/// Blocking Redis client with bounded connect/read/write timeouts.
///
/// A dropped connection is re-established lazily on the next call.
pub struct RedisBackend {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    timeout: Duration,
}

impl RedisBackend {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = Self::open_connection(&client, timeout)?;
        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            timeout,
        })
    }

    fn open_connection(client: &redis::Client, timeout: Duration) -> Result<redis::Connection> {
        let conn = client.get_connection_with_timeout(timeout)?;
        conn.set_read_timeout(Some(timeout))?;
        conn.set_write_timeout(Some(timeout))?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(Self::open_connection(&self.client, self.timeout)?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::Remote("no connection".to_string()));
        };

        f(conn).map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                *guard = None;
            }
            CacheError::from(e)
        })
    }
}

impl RemoteBackend for RedisBackend {
    fn ping(&self) -> Result<()> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        self.with_conn(|conn| match ttl_secs {
            Some(ttl) => redis::cmd("SETEX").arg(key).arg(ttl).arg(value).query(conn),
            None => redis::cmd("SET").arg(key).arg(value).query(conn),
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| redis::cmd("DEL").arg(key).query::<i64>(conn))
            .map(|n| n > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", prefix);
        self.with_conn(|conn| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query(conn)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        })
    }
}

/// In-process stand-in for a key-value server.
///
/// Honors TTLs against the supplied clock and can be switched "down" to
/// simulate an unreachable server.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, (Vec<u8>, Option<DateTime<Utc>>)>>,
    up: AtomicBool,
    clock: SharedClock,
}

impl MemoryBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            up: AtomicBool::new(true),
            clock,
        }
    }

    pub fn set_available(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Remaining backend TTL of a raw key
    pub fn ttl_of(&self, key: &str) -> Option<chrono::Duration> {
        let now = self.clock.now();
        self.data
            .lock()
            .get(key)
            .and_then(|(_, expires)| expires.map(|at| at - now))
    }

    fn check(&self) -> Result<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Remote("connection refused".to_string()))
        }
    }

    fn live<'a>(
        now: DateTime<Utc>,
        item: &'a (Vec<u8>, Option<DateTime<Utc>>),
    ) -> Option<&'a Vec<u8>> {
        match item.1 {
            Some(expires) if expires <= now => None,
            _ => Some(&item.0),
        }
    }
}

impl RemoteBackend for MemoryBackend {
    fn ping(&self) -> Result<()> {
        self.check()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let now = self.clock.now();
        Ok(self
            .data
            .lock()
            .get(key)
            .and_then(|item| Self::live(now, item))
            .cloned())
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        self.check()?;
        let now = self.clock.now();
        let expires = ttl_secs.and_then(|t| {
            let ttl = chrono::TimeDelta::try_seconds(i64::try_from(t).ok()?)?;
            now.checked_add_signed(ttl)
        });
        self.data
            .lock()
            .insert(key.to_string(), (value.to_vec(), expires));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.data.lock().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = self.clock.now();
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(k, item)| k.starts_with(prefix) && Self::live(now, item).is_some())
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Cache tier stored on a remote key-value server
pub struct RemoteTier {
    backend: Option<Box<dyn RemoteBackend>>,
    prefix: String,
    clock: SharedClock,
}

impl RemoteTier {
    /// Wrap `backend`, probing it once; a failed probe disables the tier
    pub fn new(
        backend: Box<dyn RemoteBackend>,
        prefix: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        let prefix = prefix.into();
        match backend.ping() {
            Ok(()) => {
                info!("Remote cache available (prefix={})", prefix);
                Self {
                    backend: Some(backend),
                    prefix,
                    clock,
                }
            }
            Err(e) => {
                warn!("Remote cache unavailable: {}", e);
                Self::unavailable(prefix, clock)
            }
        }
    }

    /// Connect to the Redis server described by `config`
    pub fn connect(config: &RemoteConfig, clock: SharedClock) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        match RedisBackend::connect(&config.url, timeout) {
            Ok(backend) => Self::new(Box::new(backend), config.prefix.clone(), clock),
            Err(e) => {
                warn!("Remote cache unavailable ({}): {}", config.url, e);
                Self::unavailable(config.prefix.clone(), clock)
            }
        }
    }

    /// Permanently disabled tier
    pub fn unavailable(prefix: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            backend: None,
            prefix: prefix.into(),
            clock,
        }
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip_key<'a>(&self, remote_key: &'a str) -> &'a str {
        remote_key.strip_prefix(&self.prefix).unwrap_or(remote_key)
    }

    fn write(
        &self,
        backend: &dyn RemoteBackend,
        entry: &CacheEntry,
        ttl: Option<u64>,
    ) -> Result<()> {
        let data = rmp_serde::to_vec_named(entry)
            .map_err(|e| CacheError::Codec(crate::error::CodecError::Encode(e.to_string())))?;
        backend.set(&self.make_key(&entry.key), &data, ttl)
    }

    fn read(
        &self,
        backend: &dyn RemoteBackend,
        key: &str,
        record_access: bool,
    ) -> TierResult<CacheEntry> {
        let remote_key = self.make_key(key);
        let data = match backend.get(&remote_key) {
            Ok(Some(data)) => data,
            Ok(None) => return TierResult::Miss,
            Err(e) => {
                warn!("Remote cache get failed for {}: {}", key, e);
                return TierResult::Unavailable;
            }
        };

        let mut entry: CacheEntry = match rmp_serde::from_slice(&data) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping undecodable remote cache entry {}: {}", key, e);
                let _ = backend.delete(&remote_key);
                return TierResult::Miss;
            }
        };

        if !record_access {
            return TierResult::Hit(entry);
        }

        let now = self.clock.now();
        if entry.is_expired_at(now) {
            let _ = backend.delete(&remote_key);
            debug!("Remote cache expired on access: {}", key);
            return TierResult::Miss;
        }

        entry.update_access_at(now);
        // Rewriting refreshes the backend TTL to the remaining lifetime
        let remaining = entry.remaining_ttl_secs(now).map(|t| t.max(1));
        if let Err(e) = self.write(backend, &entry, remaining) {
            warn!("Remote cache access update failed for {}: {}", key, e);
        }

        TierResult::Hit(entry)
    }
}

impl CacheTier for RemoteTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::Remote
    }

    fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    fn get(&self, key: &str) -> TierResult<CacheEntry> {
        match &self.backend {
            Some(backend) => self.read(&**backend, key, true),
            None => TierResult::Miss,
        }
    }

    fn peek(&self, key: &str) -> TierResult<CacheEntry> {
        match &self.backend {
            Some(backend) => self.read(&**backend, key, false),
            None => TierResult::Miss,
        }
    }

    fn put(&self, entry: &CacheEntry) -> TierWrite {
        let Some(backend) = &self.backend else {
            return TierWrite::Unavailable;
        };
        match self.write(&**backend, entry, entry.ttl) {
            Ok(()) => TierWrite::Stored,
            Err(CacheError::Codec(e)) => {
                warn!("Remote cache cannot encode {}: {}", entry.key, e);
                TierWrite::Rejected
            }
            Err(e) => {
                warn!("Remote cache put failed for {}: {}", entry.key, e);
                TierWrite::Unavailable
            }
        }
    }

    fn remove(&self, key: &str) -> TierResult<()> {
        let Some(backend) = &self.backend else {
            return TierResult::Miss;
        };
        match backend.delete(&self.make_key(key)) {
            Ok(true) => TierResult::Hit(()),
            Ok(false) => TierResult::Miss,
            Err(e) => {
                warn!("Remote cache remove failed for {}: {}", key, e);
                TierResult::Unavailable
            }
        }
    }

    fn clear(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let keys = match backend.scan_prefix(&self.prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Remote cache clear failed: {}", e);
                return false;
            }
        };
        for key in keys {
            if let Err(e) = backend.delete(&key) {
                warn!("Remote cache clear failed on {}: {}", key, e);
                return false;
            }
        }
        true
    }

    fn keys(&self) -> Vec<String> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        match backend.scan_prefix(&self.prefix) {
            Ok(keys) => keys
                .iter()
                .map(|k| self.strip_key(k).to_string())
                .collect(),
            Err(e) => {
                warn!("Remote cache key scan failed: {}", e);
                Vec::new()
            }
        }
    }

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn byte_size(&self) -> usize {
        self.keys()
            .iter()
            .filter_map(|k| self.peek(k).hit())
            .map(|e| e.size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::compression::Compressor;
    use crate::entry::CacheValue;

    fn entry(key: &str, value: i64, ttl: Option<u64>, clock: &ManualClock) -> CacheEntry {
        let (v, size) = CacheValue::encode(&value, &Compressor::default()).unwrap();
        CacheEntry::new(key, v, size, clock.now()).with_ttl(ttl)
    }

    fn setup() -> (RemoteTier, Arc<MemoryBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let tier = RemoteTier::new(Box::new(backend.clone()), "cache:", clock.clone());
        (tier, backend, clock)
    }

    #[test]
    fn test_put_get_namespaced() {
        let (tier, backend, clock) = setup();
        assert!(tier.put(&entry("answer", 42, None, &clock)).is_stored());

        assert!(backend.get("cache:answer").unwrap().is_some());
        let hit = tier.get("answer").hit().unwrap();
        assert_eq!(hit.value.decode::<i64>().unwrap(), 42);
        assert_eq!(tier.keys(), vec!["answer".to_string()]);
    }

    #[test]
    fn test_access_rewrites_with_remaining_ttl() {
        let (tier, backend, clock) = setup();
        tier.put(&entry("k", 1, Some(100), &clock));

        clock.advance_secs(40);
        let hit = tier.get("k").hit().unwrap();
        assert_eq!(hit.access_count, 2);

        let ttl = backend.ttl_of("cache:k").unwrap();
        assert_eq!(ttl.num_seconds(), 60);
        assert_eq!(tier.peek("k").hit().unwrap().access_count, 2);
    }

    #[test]
    fn test_logical_expiry_checked_on_read() {
        let (tier, backend, clock) = setup();
        // Backend keeps the key forever; the entry itself says 5s
        let e = entry("skewed", 1, Some(5), &clock);
        backend
            .set("cache:skewed", &rmp_serde::to_vec_named(&e).unwrap(), None)
            .unwrap();

        clock.advance_secs(6);
        assert_eq!(tier.get("skewed"), TierResult::Miss);
        assert!(backend.get("cache:skewed").unwrap().is_none());
    }

    #[test]
    fn test_unreachable_backend_is_silent() {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = MemoryBackend::new(clock.clone());
        backend.set_available(false);
        let tier = RemoteTier::new(Box::new(backend), "cache:", clock.clone());

        assert!(!tier.is_available());
        assert_eq!(tier.put(&entry("k", 1, None, &clock)), TierWrite::Unavailable);
        assert_eq!(tier.get("k"), TierResult::Miss);
        assert_eq!(tier.remove("k"), TierResult::Miss);
        assert!(!tier.clear());
        assert!(tier.keys().is_empty());
    }

    #[test]
    fn test_runtime_failure_reports_unavailable() {
        let (tier, backend, clock) = setup();
        tier.put(&entry("k", 1, None, &clock));
        backend.set_available(false);

        assert_eq!(tier.get("k"), TierResult::Unavailable);
        assert_eq!(tier.put(&entry("k2", 2, None, &clock)), TierWrite::Unavailable);

        backend.set_available(true);
        assert!(tier.get("k").is_hit());
    }

    #[test]
    fn test_corrupt_entry_deleted() {
        let (tier, backend, _clock) = setup();
        backend.set("cache:junk", &[0xc1, 0xc1], None).unwrap();

        assert_eq!(tier.get("junk"), TierResult::Miss);
        assert!(backend.get("cache:junk").unwrap().is_none());
    }

    #[test]
    fn test_clear_only_touches_namespace() {
        let (tier, backend, clock) = setup();
        tier.put(&entry("a", 1, None, &clock));
        backend.set("other:b", b"keep", None).unwrap();

        assert!(tier.clear());
        assert!(tier.is_empty());
        assert!(backend.get("other:b").unwrap().is_some());
    }
}
