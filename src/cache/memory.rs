//! In-memory LRU tier bounded by item count and estimated bytes

use std::time::{Duration, Instant};

use lru::LruCache;

use super::value::CacheValue;

struct MemoryEntry {
    value: CacheValue,
    size: usize,
    last_access: Instant,
}

/// Returned when a single value is larger than the whole byte budget
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Oversized {
    pub size: usize,
    pub max_bytes: usize,
}

/// LRU map with a single global recency order.
///
/// After every insert `len() <= max_items` and `bytes() <= max_bytes` hold,
/// and the entry just inserted is never the one evicted.
pub struct MemoryTier {
    entries: LruCache<String, MemoryEntry>,
    max_items: usize,
    max_bytes: usize,
    bytes: usize,
}

impl MemoryTier {
    #[must_use]
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_items: max_items.max(1),
            max_bytes,
            bytes: 0,
        }
    }

    /// Look up a value, refreshing its recency and access time
    pub fn get(&mut self, key: &str) -> Option<CacheValue> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Insert a value and evict least-recently-used entries until both bounds
    /// hold. Returns the evicted keys in eviction order. An oversized value is
    /// rejected, and any older value under the same key is removed.
    pub fn insert(
        &mut self,
        key: String,
        value: CacheValue,
        size: usize,
    ) -> Result<Vec<String>, Oversized> {
        // A rejected replacement still drops the previous value for `key`.
        self.remove(&key);

        if size > self.max_bytes {
            return Err(Oversized {
                size,
                max_bytes: self.max_bytes,
            });
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.max_items {
            match self.pop_lru() {
                Some(old) => evicted.push(old),
                None => break,
            }
        }

        self.entries.put(
            key,
            MemoryEntry {
                value,
                size,
                last_access: Instant::now(),
            },
        );
        self.bytes += size;

        // The new entry is most recent and fits on its own, so it is never reached here.
        while self.bytes > self.max_bytes {
            match self.pop_lru() {
                Some(old) => evicted.push(old),
                None => break,
            }
        }

        Ok(evicted)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes = self.bytes.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    /// Drop entries not accessed within `ttl`; returns the removed keys
    pub fn expire(&mut self, ttl: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_access.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            self.remove(key);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (key, entry) = self.entries.pop_lru()?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CacheValue {
        CacheValue::from(s)
    }

    #[test]
    fn count_bound_evicts_exactly_the_oldest() {
        let mut tier = MemoryTier::new(3, 1_000);
        for key in ["a", "b", "c"] {
            assert!(tier.insert(key.into(), text(key), 1).unwrap().is_empty());
        }

        let evicted = tier.insert("d".into(), text("d"), 1).unwrap();

        assert_eq!(evicted, vec!["a".to_string()]);
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn access_refreshes_recency() {
        let mut tier = MemoryTier::new(2, 1_000);
        tier.insert("a".into(), text("a"), 1).unwrap();
        tier.insert("b".into(), text("b"), 1).unwrap();
        let _ = tier.get("a");

        let evicted = tier.insert("c".into(), text("c"), 1).unwrap();

        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(tier.contains("a"));
    }

    #[test]
    fn byte_bound_evicts_until_it_holds() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert("a".into(), text("a"), 40).unwrap();
        tier.insert("b".into(), text("b"), 40).unwrap();

        let evicted = tier.insert("c".into(), text("c"), 90).unwrap();

        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tier.bytes(), 90);
        assert!(tier.contains("c"));
    }

    #[test]
    fn oversized_value_is_rejected_without_evicting() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert("a".into(), text("a"), 10).unwrap();

        assert!(tier.insert("big".into(), text("big"), 101).is_err());
        assert!(tier.contains("a"));
    }

    #[test]
    fn oversized_replacement_drops_the_old_value() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert("a".into(), text("a"), 10).unwrap();

        assert!(tier.insert("a".into(), text("a2"), 101).is_err());
        assert!(!tier.contains("a"));
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn replacing_a_key_updates_bytes() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert("a".into(), text("a"), 10).unwrap();
        tier.insert("a".into(), text("a2"), 30).unwrap();

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), 30);
        assert_eq!(tier.get("a"), Some(text("a2")));
    }

    #[test]
    fn expire_drops_idle_entries() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert("a".into(), text("a"), 10).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        tier.insert("b".into(), text("b"), 10).unwrap();

        let expired = tier.expire(Duration::from_millis(10));

        assert_eq!(expired, vec!["a".to_string()]);
        assert_eq!(tier.bytes(), 10);
    }
}
