use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tiercache::{
    CacheConfig, CacheLevel, CacheStrategy, IntelligentCache, MAX_TTL_SECS, ManualClock, Priority,
    PutOptions,
};

fn config(dir: &TempDir, strategy: CacheStrategy, memory_entries: usize) -> CacheConfig {
    CacheConfig {
        strategy,
        levels: vec![CacheLevel::Memory, CacheLevel::Disk],
        max_memory_entries: memory_entries,
        disk_cache_path: dir.path().join("cache.db"),
        ..Default::default()
    }
}

fn manual_cache(
    dir: &TempDir,
    strategy: CacheStrategy,
    memory_entries: usize,
) -> (IntelligentCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = IntelligentCache::builder(config(dir, strategy, memory_entries))
        .clock(clock.clone())
        .without_worker()
        .build()
        .unwrap();
    (cache, clock)
}

#[test]
fn test_put_then_get_without_ttl() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 100);

    let rows = vec!["alpha".to_string(), "beta".to_string()];
    assert!(cache.put("query:1", &rows, PutOptions::new().persistent()));
    assert_eq!(cache.get("query:1", Vec::<String>::new()), rows);
    assert_eq!(cache.levels(), vec![CacheLevel::Memory, CacheLevel::Disk]);
}

#[test]
fn test_ttl_expiry_on_access_and_sweep() {
    let dir = TempDir::new().unwrap();
    let (cache, clock) = manual_cache(&dir, CacheStrategy::Lru, 100);

    cache.put("short", &1u32, PutOptions::new().ttl(10));
    cache.put("sweep", &2u32, PutOptions::new().ttl(10));
    cache.put("long", &3u32, PutOptions::new().ttl(1000));

    clock.advance_secs(5);
    assert_eq!(cache.get("short", 0u32), 1);

    clock.advance_secs(6);
    assert_eq!(cache.get("short", 0u32), 0);

    // "sweep" was never read after expiring; the sweep finds it in both tiers
    let report = cache.run_maintenance();
    assert_eq!(report.expired, 2);
    assert!(cache.inspect("sweep").is_none());
    assert!(cache.inspect("short").is_none());
    assert_eq!(cache.get("long", 0u32), 3);

    let stats = cache.get_stats();
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.cache_sizes_per_tier[&CacheLevel::Memory], 1);
    assert_eq!(stats.cache_sizes_per_tier[&CacheLevel::Disk], 1);
}

#[test]
fn test_huge_ttl_stores_without_expiry() {
    let dir = TempDir::new().unwrap();
    let (cache, clock) = manual_cache(&dir, CacheStrategy::Lru, 100);

    assert!(cache.put("big", &1u32, PutOptions::new().ttl(1 << 60)));
    assert!(cache.put("max", &2u32, PutOptions::new().ttl(u64::MAX)));
    assert!(cache.put("edge", &3u32, PutOptions::new().ttl(MAX_TTL_SECS)));

    clock.advance_secs(86_400);
    assert_eq!(cache.get("big", 0u32), 1);
    assert_eq!(cache.get("max", 0u32), 2);
    assert_eq!(cache.get("edge", 0u32), 3);

    assert_eq!(cache.inspect("big").unwrap().1.ttl, None);
    assert_eq!(cache.inspect("max").unwrap().1.ttl, None);
    assert_eq!(cache.inspect("edge").unwrap().1.ttl, Some(MAX_TTL_SECS));

    // Disk rows read back the same way
    cache.clear(None);
    assert!(cache.put("big", &1u32, PutOptions::new().ttl(u64::MAX)));
    assert_eq!(cache.run_maintenance().expired, 0);
    assert_eq!(cache.get_stats().cache_sizes_per_tier[&CacheLevel::Disk], 1);
}

#[test]
fn test_disk_hit_promotes_to_memory() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 1);

    cache.put("a", &"first".to_string(), PutOptions::new());
    cache.put("b", &"second".to_string(), PutOptions::new());

    // Memory holds one entry, so "a" only survives on disk
    let (level, _) = cache.inspect("a").unwrap();
    assert_eq!(level, CacheLevel::Disk);

    assert_eq!(cache.lookup::<String>("a").as_deref(), Some("first"));
    let (level, entry) = cache.inspect("a").unwrap();
    assert_eq!(level, CacheLevel::Memory);
    assert_eq!(entry.access_count, 2);

    // The slower tier keeps its copy
    assert_eq!(cache.get_stats().cache_sizes_per_tier[&CacheLevel::Disk], 2);
}

#[test]
fn test_lru_capacity_through_cache() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let config = CacheConfig {
        strategy: CacheStrategy::Lru,
        levels: vec![CacheLevel::Memory],
        max_memory_entries: 2,
        disk_cache_path: dir.path().join("unused.db"),
        ..Default::default()
    };
    let cache = IntelligentCache::builder(config)
        .clock(clock)
        .without_worker()
        .build()
        .unwrap();

    cache.put("k1", &1u8, PutOptions::new());
    cache.put("k2", &2u8, PutOptions::new());
    assert_eq!(cache.get("k1", 0u8), 1);
    cache.put("k3", &3u8, PutOptions::new());

    assert_eq!(cache.get("k2", 0u8), 0);
    assert_eq!(cache.get("k1", 0u8), 1);
    assert_eq!(cache.get("k3", 0u8), 3);
    assert_eq!(cache.get_stats().tiers[0].capacity_evictions, 1);
}

#[test]
fn test_clear_by_tag_removes_only_tagged() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 100);

    cache.put("x1", &1u8, PutOptions::new().tag("x"));
    cache.put("x2", &2u8, PutOptions::new().tags(["x", "y"]));
    cache.put("y1", &3u8, PutOptions::new().tag("y"));
    cache.put("plain", &4u8, PutOptions::new());

    let tags = vec!["x".to_string()];
    let removed = cache.clear(Some(tags.as_slice()));
    // Two entries in each of two tiers
    assert_eq!(removed, 4);

    assert_eq!(cache.lookup::<u8>("x1"), None);
    assert_eq!(cache.lookup::<u8>("x2"), None);
    assert_eq!(cache.lookup::<u8>("y1"), Some(3));
    assert_eq!(cache.lookup::<u8>("plain"), Some(4));

    assert_eq!(cache.clear(Some(Vec::new().as_slice())), 0);
    assert_eq!(cache.keys().len(), 2);
}

#[test]
fn test_full_clear_resets_stats() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 100);

    cache.put("a", &1u8, PutOptions::new());
    cache.get("a", 0u8);
    cache.get("missing", 0u8);

    cache.clear(None);
    let stats = cache.get_stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.entry_count, 0);
    assert!(cache.keys().is_empty());
}

#[test]
fn test_remove_reports_presence() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lfu, 10);

    cache.put("a", &1u8, PutOptions::new());
    assert!(cache.remove("a"));
    assert!(!cache.remove("a"));
    assert_eq!(cache.lookup::<u8>("a"), None);
}

#[test]
fn test_hit_rate_after_scripted_sequence() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 10);

    cache.put("a", &1u8, PutOptions::new());
    for _ in 0..3 {
        cache.get("a", 0u8);
    }
    for key in ["b", "c", "d", "e", "f"] {
        cache.get(key, 0u8);
    }

    let stats = cache.get_stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 5);
    assert_eq!(stats.hit_rate, 37.5);
    assert!(stats.avg_access_time_ms >= 0.0);
}

#[test]
fn test_stats_report_shape() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Adaptive, 10);

    cache.put(
        "meta",
        &vec![1u64; 16],
        PutOptions::new()
            .priority(Priority::High)
            .metadata("source", serde_json::json!("report")),
    );

    let stats = cache.get_stats();
    assert_eq!(stats.entry_count, 2);
    assert!(stats.total_size > 0);
    assert!(stats.memory_usage > 0);
    assert_eq!(stats.strategy, CacheStrategy::Adaptive);
    assert_eq!(stats.default_ttl_secs, 3600);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["strategy"], "adaptive");
    assert_eq!(json["cache_sizes_per_tier"]["disk"], 1);

    let (_, entry) = cache.inspect("meta").unwrap();
    assert_eq!(entry.priority, Priority::High);
    assert_eq!(entry.metadata["source"], "report");
}

#[test]
fn test_adaptive_ttl_grows_and_shrinks() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Adaptive, 10);

    // No lookups yet: nothing to tune on
    assert!(!cache.run_maintenance().ttl_changed());

    for key in ["m1", "m2", "m3"] {
        cache.get(key, 0u8);
    }
    let report = cache.run_maintenance();
    assert_eq!((report.ttl_before, report.ttl_after), (3600, 4320));
    assert_eq!(cache.default_ttl_secs(), 4320);

    // Entries written now pick up the new default
    cache.put("hot", &1u8, PutOptions::new());
    assert_eq!(cache.inspect("hot").unwrap().1.ttl, Some(4320));

    for _ in 0..40 {
        cache.get("hot", 0u8);
    }
    // 40 / 43 > 90%
    let report = cache.run_maintenance();
    assert_eq!(report.ttl_after, 3888);
}

#[test]
fn test_non_adaptive_strategy_keeps_ttl() {
    let dir = TempDir::new().unwrap();
    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 10);

    cache.get("miss", 0u8);
    let report = cache.run_maintenance();
    assert!(!report.ttl_changed());
    assert_eq!(cache.default_ttl_secs(), 3600);
}

#[test]
fn test_disk_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 10);
        cache.put("durable", &"kept".to_string(), PutOptions::new().persistent());
    }

    let (cache, _) = manual_cache(&dir, CacheStrategy::Lru, 10);
    let (level, _) = cache.inspect("durable").unwrap();
    assert_eq!(level, CacheLevel::Disk);
    assert_eq!(cache.get("durable", String::new()), "kept");
}

#[test]
fn test_unopenable_disk_is_skipped() {
    let dir = TempDir::new().unwrap();
    // A directory where the database file should be
    let bogus = dir.path().join("db-is-a-dir");
    std::fs::create_dir_all(&bogus).unwrap();

    let config = CacheConfig {
        levels: vec![CacheLevel::Memory, CacheLevel::Disk],
        disk_cache_path: bogus,
        ..Default::default()
    };
    let cache = IntelligentCache::builder(config).without_worker().build().unwrap();

    assert_eq!(cache.levels(), vec![CacheLevel::Memory]);
    assert!(cache.put("a", &1u8, PutOptions::new()));
    assert_eq!(cache.get("a", 0u8), 1);
}

#[test]
fn test_disk_failure_after_open_falls_back_to_memory() {
    let dir = TempDir::new().unwrap();
    let (cache, clock) = manual_cache(&dir, CacheStrategy::Lru, 100);
    cache.put("before", &1u8, PutOptions::new());

    let conn = rusqlite::Connection::open(dir.path().join("cache.db")).unwrap();
    conn.execute_batch("DROP TABLE cache_entries").unwrap();
    drop(conn);

    assert!(cache.put("after", &2u8, PutOptions::new().ttl(5)));
    assert_eq!(cache.get("after", 0u8), 2);
    assert_eq!(cache.get("before", 0u8), 1);
    assert_eq!(cache.lookup::<u8>("missing"), None);

    let stats = cache.get_stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.cache_sizes_per_tier[&CacheLevel::Disk], 0);
    assert_eq!(stats.cache_sizes_per_tier[&CacheLevel::Memory], 2);

    clock.advance_secs(10);
    assert_eq!(cache.run_maintenance().expired, 1);
    assert!(cache.remove("before"));
    assert!(cache.keys().is_empty());
    cache.clear(None);
}

#[test]
fn test_short_ttl_expires_in_real_time() {
    let dir = TempDir::new().unwrap();
    let cache = IntelligentCache::init(config(&dir, CacheStrategy::Lru, 10)).unwrap();

    cache.put("a", &1i32, PutOptions::new().ttl(1));
    assert_eq!(cache.get("a", 0i32), 1);

    thread::sleep(Duration::from_millis(1500));
    assert_eq!(cache.get("a", 0i32), 0);

    cache.shutdown();
}

#[test]
fn test_background_worker_sweeps() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, CacheStrategy::Lru, 10);
    config.cleanup_interval_secs = 1;
    let clock = Arc::new(ManualClock::starting_now());
    let cache = IntelligentCache::builder(config)
        .clock(clock.clone())
        .build()
        .unwrap();

    cache.put("gone", &1u8, PutOptions::new().ttl(5));
    clock.advance_secs(10);

    thread::sleep(Duration::from_millis(2500));
    assert!(cache.keys().is_empty());
    assert_eq!(cache.get_stats().evictions, 2);

    cache.shutdown();
}
