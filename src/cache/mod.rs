//! Generic two-tier (memory + disk) key/value cache
//!
//! The memory tier is an LRU bounded by item count and estimated bytes. The
//! optional disk tier keeps one backing file per entry, named by a hash of the
//! key, and a JSON manifest describing every file. Disk problems never reach
//! callers: a corrupt entry is purged and reported as a miss, and a manifest
//! that cannot be read or written turns the cache memory-only for the rest of
//! the session.

mod disk;
mod memory;
mod value;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, info, trace, warn};

pub use disk::{DiskTier, ENTRY_EXTENSION, MANIFEST_FILE, ManifestEntry, entry_file_name};
pub use memory::{MemoryTier, Oversized};
pub use value::{CacheValue, DEFAULT_SIZE_ESTIMATE, PayloadKind};

/// Errors internal to the disk tier; absorbed by [`TwoTierCache`]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("value cannot be persisted")]
    NotPersistable,

    #[error("manifest unavailable: {0}")]
    Manifest(String),
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_items: usize,
    pub max_bytes: usize,
    /// Directory of the disk tier; `None` keeps the cache in memory only
    pub disk_dir: Option<PathBuf>,
    /// Memory entries idle for longer than this are dropped by cleanup
    pub memory_ttl: Duration,
    /// Disk entries written longer ago than this are dropped by cleanup
    pub disk_ttl: Duration,
    /// Period of the auto-cleanup job
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 200,
            max_bytes: 256 * 1024 * 1024,
            disk_dir: None,
            memory_ttl: Duration::from_secs(60 * 60),
            disk_ttl: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Disk,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub memory_removed: usize,
    pub disk_removed: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.memory_removed + self.disk_removed
    }
}

/// Observability signals
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    Hit { key: String, tier: Tier },
    Miss { key: String },
    Evicted { key: String },
    CleanedUp(CleanupReport),
    /// Disk tier disabled for the rest of the session
    Degraded { reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub items: usize,
    pub bytes: usize,
    pub disk_items: usize,
    pub disk_enabled: bool,
}

struct Inner {
    memory: MemoryTier,
    disk: Option<DiskTier>,
    memory_hits: u64,
    disk_hits: u64,
    misses: u64,
}

/// Two-tier cache service.
///
/// Every operation, including the periodic cleanup pass, runs under one lock,
/// so cleanup and [`TwoTierCache::clear`] never interleave.
pub struct TwoTierCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl TwoTierCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let disk = config
            .disk_dir
            .as_ref()
            .and_then(|dir| match DiskTier::open(dir) {
                Ok(tier) => Some(tier),
                Err(e) => {
                    warn!("Disk cache disabled for this session: {e}");
                    None
                }
            });

        Self {
            inner: Mutex::new(Inner {
                memory: MemoryTier::new(config.max_items, config.max_bytes),
                disk,
                memory_hits: 0,
                disk_hits: 0,
                misses: 0,
            }),
            config,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Memory-only cache with the given bounds
    #[must_use]
    pub fn in_memory(max_items: usize, max_bytes: usize) -> Self {
        Self::new(CacheConfig {
            max_items,
            max_bytes,
            ..CacheConfig::default()
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Receive hit/miss/eviction/cleanup events from now on
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Look up `key` in memory, then on disk. Disk hits are promoted into the
    /// memory tier.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(value) = inner.memory.get(key) {
            inner.memory_hits += 1;
            trace!("Cache hit (memory): {key}");
            self.emit(CacheEvent::Hit {
                key: key.to_string(),
                tier: Tier::Memory,
            });
            return Some(value);
        }

        let mut degrade = None;
        if let Some(disk) = inner.disk.as_mut() {
            match disk.read(key) {
                Ok(Some(value)) => {
                    inner.disk_hits += 1;
                    trace!("Cache hit (disk): {key}");
                    match inner
                        .memory
                        .insert(key.to_string(), value.clone(), value.estimated_size())
                    {
                        Ok(evicted) => self.emit_evicted(evicted),
                        Err(_) => debug!("Disk entry {key} too large to promote"),
                    }
                    self.emit(CacheEvent::Hit {
                        key: key.to_string(),
                        tier: Tier::Disk,
                    });
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Purging unreadable cache entry {key}: {e}");
                    if let Err(e) = disk.remove(key) {
                        degrade = Some(e.to_string());
                    }
                }
            }
        }
        if let Some(reason) = degrade {
            self.degrade(inner, reason);
        }

        inner.misses += 1;
        trace!("Cache miss: {key}");
        self.emit(CacheEvent::Miss {
            key: key.to_string(),
        });
        None
    }

    /// Store a value. Returns `false` only if the value alone exceeds the byte
    /// bound. Disk failures are logged and never fail the put.
    pub fn put(&self, key: impl Into<String>, value: impl Into<CacheValue>, persist: bool) -> bool {
        let key = key.into();
        let value = value.into();
        let size = value.estimated_size();

        let mut guard = self.lock();
        let inner = &mut *guard;

        match inner.memory.insert(key.clone(), value.clone(), size) {
            Ok(evicted) => self.emit_evicted(evicted),
            Err(Oversized { size, max_bytes }) => {
                warn!("Not caching {key}: {size} bytes exceeds the {max_bytes} byte bound");
                // The memory tier already dropped any older value; the disk copy goes too.
                let stale = inner.disk.as_mut().map(|disk| disk.remove(&key));
                if let Some(Err(e)) = stale {
                    self.degrade(inner, e.to_string());
                }
                return false;
            }
        }

        let mut degrade = None;
        if let Some(disk) = inner.disk.as_mut() {
            // A stale persisted copy must not resurface after memory eviction.
            let result = if persist {
                disk.write(&key, &value)
            } else {
                disk.remove(&key).map(|_| ())
            };
            match result {
                Ok(()) => {}
                Err(CacheError::NotPersistable) => debug!("{key} is memory-only"),
                Err(CacheError::Manifest(reason)) => degrade = Some(reason),
                Err(e) => warn!("Failed to persist {key}: {e}"),
            }
        }
        if let Some(reason) = degrade {
            self.degrade(inner, reason);
        }

        true
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        inner.memory.contains(key) || inner.disk.as_ref().is_some_and(|d| d.contains(key))
    }

    /// Remove `key` from both tiers
    pub fn remove(&self, key: &str) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let in_memory = inner.memory.remove(key);

        let mut on_disk = false;
        let mut degrade = None;
        if let Some(disk) = inner.disk.as_mut() {
            match disk.remove(key) {
                Ok(removed) => on_disk = removed,
                Err(e) => degrade = Some(e.to_string()),
            }
        }
        if let Some(reason) = degrade {
            self.degrade(inner, reason);
        }

        in_memory || on_disk
    }

    /// Drop idle memory entries and old disk entries
    pub fn cleanup_expired(&self) -> CleanupReport {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let memory_removed = inner.memory.expire(self.config.memory_ttl).len();
        let mut disk_removed = 0;
        let mut degrade = None;
        if let Some(disk) = inner.disk.as_mut() {
            match disk.expire(self.config.disk_ttl) {
                Ok(removed) => disk_removed = removed.len(),
                Err(e) => degrade = Some(e.to_string()),
            }
        }
        if let Some(reason) = degrade {
            self.degrade(inner, reason);
        }

        let report = CleanupReport {
            memory_removed,
            disk_removed,
        };
        if report.total() > 0 {
            info!(
                "Cache cleanup removed {} memory and {} disk entries",
                report.memory_removed, report.disk_removed
            );
        }
        self.emit(CacheEvent::CleanedUp(report));
        report
    }

    /// Empty both tiers and delete every backing file
    pub fn clear(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.memory.clear();

        let mut degrade = None;
        if let Some(disk) = inner.disk.as_mut() {
            if let Err(e) = disk.clear() {
                degrade = Some(e.to_string());
            }
        }
        if let Some(reason) = degrade {
            self.degrade(inner, reason);
        }
        debug!("Cache cleared");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().memory.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_disk_enabled(&self) -> bool {
        self.lock().disk.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let hits = inner.memory_hits + inner.disk_hits;
        let lookups = hits + inner.misses;
        CacheStats {
            memory_hits: inner.memory_hits,
            disk_hits: inner.disk_hits,
            misses: inner.misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            items: inner.memory.len(),
            bytes: inner.memory.bytes(),
            disk_items: inner.disk.as_ref().map_or(0, DiskTier::len),
            disk_enabled: inner.disk.is_some(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn degrade(&self, inner: &mut Inner, reason: String) {
        if inner.disk.take().is_some() {
            warn!("Disk cache disabled for this session: {reason}");
            self.emit(CacheEvent::Degraded { reason });
        }
    }

    fn emit_evicted(&self, keys: Vec<String>) {
        for key in keys {
            trace!("Evicted {key} from memory");
            self.emit(CacheEvent::Evicted { key });
        }
    }

    fn emit(&self, event: CacheEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_cache(dir: &std::path::Path, max_items: usize) -> TwoTierCache {
        TwoTierCache::new(CacheConfig {
            max_items,
            disk_dir: Some(dir.to_path_buf()),
            ..CacheConfig::default()
        })
    }

    #[test]
    fn capacity_three_scenario() {
        let cache = TwoTierCache::in_memory(3, 1_000_000);
        for key in ["a", "b", "c", "d"] {
            assert!(cache.put(key, key, false));
        }

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("d"), Some(CacheValue::from("d")));
    }

    #[test]
    fn disk_hit_is_promoted_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 1);
        let events = cache.subscribe();

        cache.put("a", "first", true);
        cache.put("b", "second", true);
        assert_eq!(cache.get("a"), Some(CacheValue::from("first")));

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.items, 1);
        let hits: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                CacheEvent::Hit { key, tier } => Some((key, tier)),
                _ => None,
            })
            .collect();
        assert_eq!(hits, vec![("a".to_string(), Tier::Disk)]);
        assert!(cache.contains("b"));
    }

    #[test]
    fn unpersisted_put_replaces_stale_disk_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 1);

        cache.put("k", "old", true);
        cache.put("k", "new", false);
        cache.put("other", "x", false);

        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn corrupt_entry_is_purged_and_missed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path(), 1);
        cache.put("k", "value", true);
        cache.put("evictor", "x", false);
        std::fs::write(dir.path().join(entry_file_name("k")), b"garbage").unwrap();

        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains("k"));
        assert!(cache.is_disk_enabled());
    }

    #[test]
    fn corrupt_manifest_degrades_to_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"[1,2").unwrap();

        let cache = disk_cache(dir.path(), 4);

        assert!(!cache.is_disk_enabled());
        assert!(cache.put("k", "v", true));
        assert_eq!(cache.get("k"), Some(CacheValue::from("v")));
    }

    #[test]
    fn oversized_put_is_rejected() {
        let cache = TwoTierCache::in_memory(10, 4);
        assert!(!cache.put("big", "too large", false));
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_replacement_drops_older_value_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TwoTierCache::new(CacheConfig {
            max_bytes: 4,
            disk_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        });

        assert!(cache.put("k", "old", true));
        assert!(!cache.put("k", "much too large", true));

        assert_eq!(cache.get("k"), None);
        assert!(!cache.contains("k"));
        assert_eq!(cache.stats().disk_items, 0);
        assert!(!dir.path().join(entry_file_name("k")).exists());
    }

    #[test]
    fn cleanup_drops_idle_memory_entries() {
        let cache = TwoTierCache::new(CacheConfig {
            memory_ttl: Duration::ZERO,
            ..CacheConfig::default()
        });
        cache.put("k", "v", false);
        std::thread::sleep(Duration::from_millis(5));

        let report = cache.cleanup_expired();

        assert_eq!(report.memory_removed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = TwoTierCache::in_memory(10, 1_000);
        cache.put("k", "v", false);
        let _ = cache.get("k");
        let _ = cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.bytes, 1);
    }
}
