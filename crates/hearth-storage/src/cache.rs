//! Shared block cache
//!
//! The engine bypasses the OS page cache for block devices, so block
//! stores share one application-level cache mapping block ids to
//! buffers. The byte budget comes from the resource manager; eviction
//! is approximately LRU via a logical clock. Buffers are `Bytes`, so
//! hits are zero-copy and an evicted entry stays alive for any holder
//! of an outstanding clone.

use bytes::Bytes;
use hearth_common::{BlkId, VdevId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key uniquely identifying a block across all vdevs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub vdev: VdevId,
    pub blk: BlkId,
}

impl CacheKey {
    pub fn new(vdev: VdevId, blk: BlkId) -> Self {
        Self { vdev, blk }
    }
}

struct CacheEntry {
    data: Bytes,
    last_access: AtomicU64,
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

struct CacheMap {
    entries: HashMap<CacheKey, CacheEntry>,
    bytes: usize,
}

/// Byte-capped LRU cache shared by all block stores
pub struct BlockCache {
    map: RwLock<CacheMap>,
    capacity_bytes: usize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl BlockCache {
    /// Create a cache with the given byte budget
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            map: RwLock::new(CacheMap {
                entries: HashMap::new(),
                bytes: 0,
            }),
            capacity_bytes,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a block; zero-copy on hit
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let map = self.map.read();
        if let Some(entry) = map.entries.get(key) {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a block. Idempotent: re-inserting an existing key replaces
    /// the buffer and refreshes recency.
    pub fn insert(&self, key: CacheKey, data: Bytes) {
        if data.len() > self.capacity_bytes {
            return;
        }
        let clock = self.tick();
        let mut map = self.map.write();

        if let Some(old) = map.entries.remove(&key) {
            map.bytes -= old.data.len();
        }

        while map.bytes + data.len() > self.capacity_bytes {
            let Some(victim) = Self::find_lru(&map.entries) else {
                break;
            };
            if let Some(entry) = map.entries.remove(&victim) {
                map.bytes -= entry.data.len();
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        map.bytes += data.len();
        map.entries.insert(
            key,
            CacheEntry {
                data,
                last_access: AtomicU64::new(clock),
            },
        );
    }

    /// Remove a block from the cache
    pub fn invalidate(&self, key: &CacheKey) -> Option<Bytes> {
        let mut map = self.map.write();
        map.entries.remove(key).map(|entry| {
            map.bytes -= entry.data.len();
            entry.data
        })
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.map.read().entries.contains_key(key)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.map.read().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.read().entries.is_empty()
    }

    /// Bytes currently cached
    pub fn used_bytes(&self) -> usize {
        self.map.read().bytes
    }

    /// Byte budget
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut map = self.map.write();
        map.entries.clear();
        map.bytes = 0;
    }

    fn find_lru(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| *key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(blk: u32) -> CacheKey {
        CacheKey::new(0, BlkId::new(0, blk, 1))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlockCache::new(1024);
        let data = Bytes::from(vec![1, 2, 3, 4]);

        cache.insert(key(1), data.clone());
        assert_eq!(cache.get(&key(1)), Some(data));
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.used_bytes(), 4);
    }

    #[test]
    fn test_miss() {
        let cache = BlockCache::new(1024);
        assert!(cache.get(&key(9)).is_none());
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_idempotent_insert() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1), Bytes::from(vec![0u8; 100]));
        cache.insert(key(1), Bytes::from(vec![1u8; 50]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 50);
    }

    #[test]
    fn test_byte_capped_eviction_is_lru() {
        let cache = BlockCache::new(256);
        cache.insert(key(1), Bytes::from(vec![0u8; 128]));
        cache.insert(key(2), Bytes::from(vec![0u8; 128]));

        // Touch key 1 so key 2 becomes the LRU victim
        cache.get(&key(1));
        cache.insert(key(3), Bytes::from(vec![0u8; 128]));

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert!(cache.used_bytes() <= 256);
        assert!(cache.stats().evictions.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_outstanding_reference_survives_eviction() {
        let cache = BlockCache::new(128);
        let data = Bytes::from(vec![7u8; 128]);
        cache.insert(key(1), data);

        let held = cache.get(&key(1)).unwrap();
        cache.insert(key(2), Bytes::from(vec![8u8; 128]));
        assert!(!cache.contains(&key(1)));
        assert_eq!(held, Bytes::from(vec![7u8; 128]));
    }

    #[test]
    fn test_invalidate() {
        let cache = BlockCache::new(1024);
        cache.insert(key(1), Bytes::from(vec![1u8; 10]));
        assert!(cache.invalidate(&key(1)).is_some());
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_oversized_insert_is_dropped() {
        let cache = BlockCache::new(64);
        cache.insert(key(1), Bytes::from(vec![0u8; 128]));
        assert!(cache.is_empty());
    }
}
