//! Shared block cache.
//!
//! Decoded data blocks keyed by `(segment_id, block_offset)`, split over
//! independently locked LRU shards. Capacity is charged in bytes.
//!
//! Pinning: a block handed out by the cache is an `Arc<Block>`. While any
//! reader still holds that `Arc` (strong count > 1) the entry is pinned and
//! eviction skips it. If every entry in a shard is pinned the shard may sit
//! above its capacity until readers let go.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::segment::block::Block;

/// `(segment_id, block_offset)`
pub type BlockKey = (u64, u64);

struct Shard {
    lru: LruCache<BlockKey, Arc<Block>>,
    usage: usize,
    capacity: usize,
}

impl Shard {
    /// Evict least-recently-used unpinned blocks until under capacity.
    fn evict(&mut self) -> u64 {
        let mut evicted = 0;
        while self.usage > self.capacity {
            let victim = self
                .lru
                .iter()
                .rev()
                .find(|(_, block)| Arc::strong_count(block) == 1)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                break;
            };
            if let Some(block) = self.lru.pop(&key) {
                self.usage -= block.charge();
                evicted += 1;
            }
        }
        evicted
    }
}

/// Cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Bytes currently charged.
    pub usage: usize,
    pub capacity: usize,
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

pub struct BlockCache {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    /// `capacity` bytes split evenly over `shards` shards.
    /// A zero capacity disables caching; every read goes to the loader.
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = capacity.div_ceil(shards);
        BlockCache {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        lru: LruCache::unbounded(),
                        usage: 0,
                        capacity: per_shard,
                    })
                })
                .collect(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &BlockKey) -> &Mutex<Shard> {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&key.0.to_le_bytes());
        raw[8..].copy_from_slice(&key.1.to_le_bytes());
        let index = xxh3_64(&raw) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    /// Look up a block without loading it.
    pub fn get(&self, segment_id: u64, offset: u64) -> Option<Arc<Block>> {
        let key = (segment_id, offset);
        let found = self.shard(&key).lock().lru.get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Return the cached block or load, decode and insert it.
    ///
    /// `loader` runs with no shard lock held, so a slow disk read never
    /// blocks hits or evictions on the same shard. Two readers missing on the
    /// same block may both load it; the first insert wins and both get it.
    pub fn get_or_load<F>(&self, segment_id: u64, offset: u64, loader: F) -> Result<Arc<Block>>
    where
        F: FnOnce() -> Result<Block>,
    {
        if let Some(block) = self.get(segment_id, offset) {
            return Ok(block);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let block = Arc::new(loader()?);
        if self.capacity == 0 {
            return Ok(block);
        }

        let key = (segment_id, offset);
        let mut shard = self.shard(&key).lock();
        if let Some(existing) = shard.lru.get(&key) {
            return Ok(Arc::clone(existing));
        }
        shard.usage += block.charge();
        shard.lru.put(key, Arc::clone(&block));
        // The caller's clone pins the fresh block through this eviction.
        let evicted = shard.evict();
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(evicted, usage = shard.usage, "block cache eviction");
        }
        Ok(block)
    }

    /// Drop every cached block of a deleted segment.
    pub fn evict_segment(&self, segment_id: u64) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let keys: Vec<BlockKey> = shard
                .lru
                .iter()
                .filter(|(key, _)| key.0 == segment_id)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(block) = shard.lru.pop(&key) {
                    shard.usage -= block.charge();
                }
            }
        }
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().lru.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged across all shards.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.lock().usage).sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            usage: self.usage(),
            capacity: self.capacity,
        }
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        // 8 MiB over 8 shards
        BlockCache::new(8 << 20, 8)
    }
}
