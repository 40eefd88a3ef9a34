//! LRU page cache for rendered pages

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::types::Bitmap;

/// Default number of rendered pages kept per document
pub const DEFAULT_CACHE_PAGES: usize = 10;

/// LRU cache of rendered pages for one document, bounded by item count
pub struct PageCache {
    cache: LruCache<usize, Arc<Bitmap>>,
    bytes: usize,
    hits: u64,
    misses: u64,
}

impl PageCache {
    /// Create a new cache with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Get a cached page, promoting it in the LRU order
    pub fn get(&mut self, page: usize) -> Option<Arc<Bitmap>> {
        match self.cache.get(&page) {
            Some(bitmap) => {
                self.hits += 1;
                Some(Arc::clone(bitmap))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Check if a page is in the cache without promoting it
    #[must_use]
    pub fn contains(&self, page: usize) -> bool {
        self.cache.contains(&page)
    }

    /// Insert a page, evicting the least recently used one when full.
    /// Returns the shared bitmap and the evicted page, if any.
    pub fn insert(&mut self, page: usize, bitmap: Bitmap) -> (Arc<Bitmap>, Option<usize>) {
        let arc = Arc::new(bitmap);
        self.bytes += arc.byte_size();

        let evicted = match self.cache.push(page, Arc::clone(&arc)) {
            Some((old_page, old)) => {
                self.bytes = self.bytes.saturating_sub(old.byte_size());
                (old_page != page).then_some(old_page)
            }
            None => None,
        };

        (arc, evicted)
    }

    /// Clear all cached pages
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
        self.bytes = 0;
    }

    /// Drop one page
    pub fn invalidate_page(&mut self, page: usize) {
        if let Some(old) = self.cache.pop(&page) {
            self.bytes = self.bytes.saturating_sub(old.byte_size());
        }
    }

    /// Number of cached pages
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Cache capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Estimated memory held by cached bitmaps
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }

    /// Hit ratio of `get` lookups, 0.0 before any lookup
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_bitmap() -> Bitmap {
        Bitmap::filled(10, 10, [0, 0, 0, 255])
    }

    #[test]
    fn cache_insert_and_get() {
        let mut cache = PageCache::new(10);
        cache.insert(0, page_bitmap());

        assert!(cache.contains(0));
        assert!(cache.get(0).is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), 400);
    }

    #[test]
    fn cache_lru_eviction() {
        let mut cache = PageCache::new(2);

        for i in 0..3 {
            cache.insert(i, page_bitmap());
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.memory_bytes(), 800);
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = PageCache::new(2);
        cache.insert(0, page_bitmap());
        cache.insert(1, page_bitmap());
        let _ = cache.get(0);

        let (_, evicted) = cache.insert(2, page_bitmap());

        assert_eq!(evicted, Some(1));
        assert!(cache.contains(0));
    }

    #[test]
    fn reinserting_page_replaces_bytes() {
        let mut cache = PageCache::new(2);
        cache.insert(0, page_bitmap());
        let (_, evicted) = cache.insert(0, Bitmap::filled(1, 1, [0; 4]));

        assert_eq!(evicted, None);
        assert_eq!(cache.memory_bytes(), 4);
    }

    #[test]
    fn cache_invalidate_all() {
        let mut cache = PageCache::new(10);

        for i in 0..5 {
            cache.insert(i, page_bitmap());
        }

        assert_eq!(cache.len(), 5);
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[test]
    fn hit_ratio_counts_lookups() {
        let mut cache = PageCache::new(4);
        cache.insert(0, page_bitmap());
        let _ = cache.get(0);
        let _ = cache.get(1);
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
