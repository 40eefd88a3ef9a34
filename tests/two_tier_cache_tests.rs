use std::fs;
use std::sync::Arc;
use std::time::Duration;

use pagecache::cache::{
    CacheConfig, CacheEvent, CacheValue, ENTRY_EXTENSION, MANIFEST_FILE, Tier, TwoTierCache,
    entry_file_name,
};
use pagecache::jobs::{JobKind, WorkerCoordinator, spawn_cache_janitor};
use pagecache::pdf::Bitmap;
use serde_json::json;
use tempfile::TempDir;

fn disk_cache(dir: &TempDir, max_items: usize) -> TwoTierCache {
    TwoTierCache::new(CacheConfig {
        max_items,
        disk_dir: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    })
}

fn entry_files(dir: &TempDir) -> usize {
    fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
        .count()
}

#[test]
fn test_round_trip_survives_memory_eviction() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 2);

    let values = [
        ("bitmap", CacheValue::from(Bitmap::filled(7, 5, [10, 20, 30, 255]))),
        ("text", CacheValue::from("thumbnail caption")),
        ("bytes", CacheValue::from(vec![0u8, 1, 2, 254, 255])),
        ("json", CacheValue::from(json!({"page": 3, "links": [1, 2]}))),
    ];
    for (key, value) in &values {
        assert!(cache.put(*key, value.clone(), true));
    }
    assert_eq!(cache.len(), 2);

    for (key, value) in &values {
        assert_eq!(cache.get(key).as_ref(), Some(value), "{key}");
    }
    assert!(cache.stats().disk_hits >= 2);
}

#[test]
fn test_memory_only_values_are_lost_on_eviction() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 1);

    cache.put("a", "kept in memory", false);
    cache.put("b", "pushes a out", false);

    assert!(cache.get("a").is_none());
    assert_eq!(entry_files(&dir), 0);
}

#[test]
fn test_opaque_values_stay_in_memory() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 4);
    let handle: Arc<Vec<u32>> = Arc::new(vec![1, 2, 3]);

    assert!(cache.put("opaque", CacheValue::Opaque(handle.clone()), true));
    let back = cache.get("opaque").unwrap().downcast::<Vec<u32>>().unwrap();
    assert!(Arc::ptr_eq(&back, &handle));
    assert_eq!(entry_files(&dir), 0);
}

#[test]
fn test_clear_then_miss() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 10);
    for i in 0..5 {
        cache.put(format!("k{i}"), format!("v{i}"), true);
    }
    assert_eq!(entry_files(&dir), 5);

    cache.clear();
    cache.clear();

    for i in 0..5 {
        assert!(cache.get(&format!("k{i}")).is_none());
    }
    assert_eq!(entry_files(&dir), 0);
    assert!(dir.path().join(MANIFEST_FILE).exists());
    assert_eq!(cache.stats().disk_items, 0);
}

#[test]
fn test_bounds_hold_after_every_put() {
    let cache = TwoTierCache::in_memory(8, 4096);

    for i in 0..200usize {
        let size = (i * 37) % 900 + 1;
        assert!(cache.put(format!("k{i}"), vec![0u8; size], false));
        let stats = cache.stats();
        assert!(stats.items <= 8, "items {} after put {i}", stats.items);
        assert!(stats.bytes <= 4096, "bytes {} after put {i}", stats.bytes);
        assert!(cache.contains(&format!("k{i}")));
    }
}

#[test]
fn test_lru_evicts_least_recently_accessed() {
    let cache = TwoTierCache::in_memory(3, usize::MAX);
    let events = cache.subscribe();

    cache.put("a", "1", false);
    cache.put("b", "2", false);
    cache.put("c", "3", false);
    cache.get("a");
    cache.put("d", "4", false);

    let evicted: Vec<String> = events
        .try_iter()
        .filter_map(|e| match e {
            CacheEvent::Evicted { key } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec!["b".to_string()]);
    assert!(cache.contains("a"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
}

#[test]
fn test_capacity_three_scenario() {
    let cache = TwoTierCache::in_memory(3, usize::MAX);
    for key in ["a", "b", "c", "d"] {
        cache.put(key, key, false);
    }
    assert!(cache.get("a").is_none());
    assert_eq!(cache.get("d"), Some(CacheValue::from("d")));
}

#[test]
fn test_persisted_entries_reload_in_new_instance() {
    let dir = TempDir::new().unwrap();
    {
        let cache = disk_cache(&dir, 10);
        cache.put("doc.pdf#0@1", Bitmap::filled(3, 3, [1, 2, 3, 255]), true);
    }

    let cache = disk_cache(&dir, 10);
    let events = cache.subscribe();
    let value = cache.get("doc.pdf#0@1").unwrap();
    assert_eq!(value.as_bitmap().unwrap().pixels[..4], [1, 2, 3, 255]);
    assert!(matches!(
        events.try_recv(),
        Ok(CacheEvent::Hit {
            tier: Tier::Disk,
            ..
        })
    ));
    assert!(matches!(
        cache.get("doc.pdf#0@1"),
        Some(CacheValue::Bitmap(_))
    ));
    assert_eq!(cache.stats().memory_hits, 1);
}

#[test]
fn test_missing_backing_file_is_a_miss() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 1);
    cache.put("gone", "soon", true);
    cache.put("other", "evicts gone from memory", false);
    fs::remove_file(dir.path().join(entry_file_name("gone"))).unwrap();

    assert!(cache.get("gone").is_none());
    assert!(!cache.contains("gone"));
    assert!(cache.is_disk_enabled());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn test_janitor_expires_old_disk_entries() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(TwoTierCache::new(CacheConfig {
        disk_dir: Some(dir.path().to_path_buf()),
        memory_ttl: Duration::ZERO,
        disk_ttl: Duration::ZERO,
        cleanup_interval: Duration::from_millis(10),
        ..CacheConfig::default()
    }));
    let events = cache.subscribe();
    cache.put("old", "entry", true);
    std::thread::sleep(Duration::from_millis(5));

    let coordinator = WorkerCoordinator::default();
    spawn_cache_janitor(&coordinator, Arc::clone(&cache)).unwrap();

    let report = loop {
        match events.recv_timeout(Duration::from_secs(2)) {
            Ok(CacheEvent::CleanedUp(report)) => break report,
            Ok(_) => {}
            Err(e) => panic!("no cleanup pass: {e}"),
        }
    };
    coordinator.stop_job(&JobKind::CACHE_CLEANUP).unwrap();

    assert_eq!(report.memory_removed, 1);
    assert_eq!(report.disk_removed, 1);
    assert!(cache.get("old").is_none());
    assert_eq!(entry_files(&dir), 0);
}
