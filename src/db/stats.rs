use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cache::CacheStats;
use crate::compaction::CompactionOutcome;

/// Segment count and size of one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub segments: usize,
    pub bytes: u64,
}

/// Point-in-time engine counters, returned by `DB::stats`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub scans: u64,
    /// Segment probes answered by a bloom filter without touching a block.
    pub bloom_skips: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_usage: usize,
    pub flushes: u64,
    pub flush_bytes: u64,
    pub compactions: u64,
    pub compaction_bytes_read: u64,
    pub compaction_bytes_written: u64,
    /// Segment bytes written (flush + compaction) per byte of user data.
    pub write_amplification: f64,
    pub tombstones_dropped: u64,
    pub compaction_failures: u64,
    pub last_background_error: Option<String>,
    /// Bytes held by the active memtable.
    pub memtable_bytes: usize,
    /// Frozen memtables waiting for flush.
    pub immutable_memtables: usize,
    pub levels: Vec<LevelStats>,
}

impl Stats {
    pub fn total_segments(&self) -> usize {
        self.levels.iter().map(|l| l.segments).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.levels.iter().map(|l| l.bytes).sum()
    }
}

/// Live counters behind `Stats`.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub gets: AtomicU64,
    pub scans: AtomicU64,
    pub bloom_skips: AtomicU64,
    /// Key + value bytes accepted from callers.
    pub user_bytes: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_bytes: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_bytes_read: AtomicU64,
    pub compaction_bytes_written: AtomicU64,
    pub tombstones_dropped: AtomicU64,
    pub compaction_failures: AtomicU64,
    last_background_error: Mutex<Option<String>>,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_flush(&self, bytes: u64) {
        Self::bump(&self.flushes);
        Self::add(&self.flush_bytes, bytes);
    }

    pub fn record_compaction(&self, outcome: &CompactionOutcome) {
        Self::bump(&self.compactions);
        Self::add(&self.compaction_bytes_read, outcome.bytes_read);
        Self::add(&self.compaction_bytes_written, outcome.bytes_written);
        Self::add(&self.tombstones_dropped, outcome.tombstones_dropped);
    }

    pub fn record_background_error(&self, error: String) {
        *self.last_background_error.lock() = Some(error);
    }

    /// Copy the counters out. Cache and level figures are filled in by the caller.
    pub fn snapshot(&self, cache: CacheStats) -> Stats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let user_bytes = load(&self.user_bytes);
        let written = load(&self.flush_bytes) + load(&self.compaction_bytes_written);
        let write_amplification = if user_bytes == 0 {
            0.0
        } else {
            written as f64 / user_bytes as f64
        };

        Stats {
            puts: load(&self.puts),
            deletes: load(&self.deletes),
            gets: load(&self.gets),
            scans: load(&self.scans),
            bloom_skips: load(&self.bloom_skips),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            cache_usage: cache.usage,
            flushes: load(&self.flushes),
            flush_bytes: load(&self.flush_bytes),
            compactions: load(&self.compactions),
            compaction_bytes_read: load(&self.compaction_bytes_read),
            compaction_bytes_written: load(&self.compaction_bytes_written),
            write_amplification,
            tombstones_dropped: load(&self.tombstones_dropped),
            compaction_failures: load(&self.compaction_failures),
            last_background_error: self.last_background_error.lock().clone(),
            memtable_bytes: 0,
            immutable_memtables: 0,
            levels: Vec::new(),
        }
    }
}
