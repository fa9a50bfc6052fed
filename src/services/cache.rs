//! Bounded LRU cache of embeddings keyed by content fingerprint.
//!
//! Entries live in an arena of slots linked into a doubly-linked recency
//! list, with a hash index from fingerprint to slot. Promotion and eviction
//! are O(1). The cache is shared by embedding workers behind a mutex; two
//! workers racing on the same fingerprint both write and the last one wins.

use std::collections::HashMap;
use std::path::Path;

use bincode::serde::{decode_from_slice, encode_to_vec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::pipeline::memory::Reclaim;
use crate::utils::file::{calculate_checksum, write_atomic};

/// Maximum number of entries in the cache.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

const SNAPSHOT_VERSION: u32 = 1;

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of entries evicted
    pub evictions: u64,
    /// Entries currently held
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct Slot {
    key: String,
    value: Vec<f32>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed recency list. `head` is most recently used, `tail` least.
#[derive(Debug, Default)]
struct LruIndex {
    slots: Vec<Slot>,
    free: Vec<usize>,
    map: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    stats: CacheStats,
}

impl LruIndex {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.detach(idx);
            self.push_front(idx);
        }
    }

    fn evict_tail(&mut self) -> Option<String> {
        let idx = self.tail?;
        self.detach(idx);
        let key = std::mem::take(&mut self.slots[idx].key);
        self.slots[idx].value = Vec::new();
        self.map.remove(&key);
        self.free.push(idx);
        self.stats.evictions += 1;
        Some(key)
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        let idx = *self.map.get(key)?;
        self.promote(idx);
        Some(self.slots[idx].value.clone())
    }

    fn insert(&mut self, key: String, value: Vec<f32>, capacity: usize) {
        if let Some(&idx) = self.map.get(&key) {
            self.slots[idx].value = value;
            self.promote(idx);
            return;
        }

        while self.len() >= capacity {
            if self.evict_tail().is_none() {
                break;
            }
        }

        let slot = Slot {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key, idx);
    }

    /// Entries ordered least to most recently used.
    fn entries_lru_first(&self) -> Vec<(String, Vec<f32>)> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            out.push((slot.key.clone(), slot.value.clone()));
            cursor = slot.prev;
        }
        out
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.map.clear();
        self.head = None;
        self.tail = None;
    }

    /// Drop spare arena and index capacity. Returns the slots released.
    fn shrink(&mut self) -> usize {
        let before = self.slots.capacity();
        self.slots.shrink_to_fit();
        self.free.shrink_to_fit();
        self.map.shrink_to_fit();
        before - self.slots.capacity()
    }
}

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    version: u32,
    entries: Vec<(String, Vec<f32>)>,
}

/// Embedding cache with LRU eviction.
#[derive(Debug)]
pub struct EmbeddingCache {
    inner: Mutex<LruIndex>,
    capacity: usize,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` entries. A capacity of zero
    /// disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruIndex::default()),
            capacity,
        }
    }

    /// Content fingerprint of the exact chunk text.
    pub fn fingerprint(text: &str) -> String {
        calculate_checksum(text)
    }

    pub fn get(&self, fingerprint: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let found = inner.get(fingerprint);
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    pub fn put(&self, fingerprint: impl Into<String>, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        self.inner.lock().insert(fingerprint.into(), vector, self.capacity);
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.lock().map.contains_key(fingerprint)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.len(),
            ..inner.stats
        }
    }

    /// Write every entry to `path`, replacing the previous file atomically.
    pub fn save(&self, path: &Path) -> Result<usize, PersistenceError> {
        let snapshot = CacheSnapshot {
            version: SNAPSHOT_VERSION,
            entries: self.inner.lock().entries_lru_first(),
        };
        let count = snapshot.entries.len();
        let bytes = encode_to_vec(&snapshot, bincode::config::standard())?;
        write_atomic(path, &bytes)?;
        debug!("Saved {} cache entries to {}", count, path.display());
        Ok(count)
    }

    /// Load entries from `path`. A missing or unreadable file leaves the
    /// cache as it was.
    pub fn load(&self, path: &Path) -> usize {
        if !path.exists() {
            debug!("No embedding cache at {}", path.display());
            return 0;
        }

        match self.try_load(path) {
            Ok(count) => {
                info!("Loaded {} cached embeddings", count);
                count
            }
            Err(e) => {
                warn!(
                    "Ignoring unreadable embedding cache {}: {}",
                    path.display(),
                    e
                );
                0
            }
        }
    }

    fn try_load(&self, path: &Path) -> Result<usize, PersistenceError> {
        let bytes = std::fs::read(path)?;
        let (snapshot, _): (CacheSnapshot, usize) =
            decode_from_slice(&bytes, bincode::config::standard())?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::PersistError {
                path: path.display().to_string(),
                message: format!("unsupported cache version {}", snapshot.version),
            });
        }
        let count = snapshot.entries.len();
        for (key, value) in snapshot.entries {
            self.put(key, value);
        }
        Ok(count.min(self.capacity))
    }
}

impl Reclaim for EmbeddingCache {
    fn name(&self) -> &str {
        "embedding cache"
    }

    fn reclaim(&self) -> usize {
        self.inner.lock().shrink()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn v(x: f32) -> Vec<f32> {
        vec![x, x + 1.0]
    }

    #[test]
    fn test_get_after_put() {
        let cache = EmbeddingCache::new(4);
        cache.put("a", v(1.0));
        assert_eq!(cache.get("a"), Some(v(1.0)));
        assert_eq!(cache.get("b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let cache = EmbeddingCache::new(3);
        for i in 0..50 {
            cache.put(format!("k{i}"), v(i as f32));
            assert!(cache.size() <= 3);
        }
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.stats().evictions, 47);
    }

    #[test]
    fn test_evicts_least_recently_inserted() {
        let cache = EmbeddingCache::new(3);
        cache.put("a", v(1.0));
        cache.put("b", v(2.0));
        cache.put("c", v(3.0));
        cache.put("d", v(4.0));

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_get_promotes_entry() {
        let cache = EmbeddingCache::new(3);
        cache.put("a", v(1.0));
        cache.put("b", v(2.0));
        cache.put("c", v(3.0));
        assert!(cache.get("a").is_some());
        cache.put("d", v(4.0));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_put_existing_updates_and_promotes() {
        let cache = EmbeddingCache::new(2);
        cache.put("a", v(1.0));
        cache.put("b", v(2.0));
        cache.put("a", v(9.0));
        cache.put("c", v(3.0));

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get("a"), Some(v(9.0)));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_zero_capacity_is_noop() {
        let cache = EmbeddingCache::new(0);
        cache.put("a", v(1.0));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_clear() {
        let cache = EmbeddingCache::new(3);
        cache.put("a", v(1.0));
        cache.clear();
        assert_eq!(cache.size(), 0);
        cache.put("b", v(2.0));
        assert_eq!(cache.get("b"), Some(v(2.0)));
    }

    #[test]
    fn test_fingerprint_depends_on_text_only() {
        assert_eq!(
            EmbeddingCache::fingerprint("same text"),
            EmbeddingCache::fingerprint("same text")
        );
        assert_ne!(
            EmbeddingCache::fingerprint("same text"),
            EmbeddingCache::fingerprint("same text ")
        );
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let cache = EmbeddingCache::new(10);
        for i in 0..5 {
            cache.put(format!("k{i}"), v(i as f32));
        }
        assert_eq!(cache.save(&path).unwrap(), 5);

        let restored = EmbeddingCache::new(10);
        assert_eq!(restored.load(&path), 5);
        for i in 0..5 {
            assert_eq!(restored.get(&format!("k{i}")), Some(v(i as f32)));
        }
    }

    #[test]
    fn test_load_keeps_recency_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let cache = EmbeddingCache::new(3);
        cache.put("a", v(1.0));
        cache.put("b", v(2.0));
        cache.put("c", v(3.0));
        cache.get("a");
        cache.save(&path).unwrap();

        let restored = EmbeddingCache::new(3);
        restored.load(&path);
        restored.put("d", v(4.0));
        assert!(restored.contains("a"));
        assert!(!restored.contains("b"));
    }

    #[test]
    fn test_load_missing_or_malformed() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(3);
        assert_eq!(cache.load(&dir.path().join("absent.bin")), 0);

        let bad = dir.path().join("bad.bin");
        std::fs::write(&bad, b"not a cache").unwrap();
        assert_eq!(cache.load(&bad), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_reclaim_releases_spare_capacity() {
        let cache = EmbeddingCache::new(100);
        for i in 0..100 {
            cache.put(format!("k{i}"), v(i as f32));
        }
        cache.clear();
        assert!(cache.reclaim() > 0);
        cache.put("x", v(1.0));
        assert_eq!(cache.get("x"), Some(v(1.0)));
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(EmbeddingCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("k{}", (i + t) % 80);
                        if cache.get(&key).is_none() {
                            cache.put(key, v(i as f32));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.size() <= 64);
    }
}
