use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::wal::SyncPolicy;

/// When compaction may discard a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstonePolicy {
    /// Only when the compaction writes into the last configured level;
    /// nothing older can exist below it.
    LastLevel,
    /// At any level, once no deeper level covers the key and the tombstone
    /// is at least `retain_sequences` writes old.
    Grace { retain_sequences: u64 },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Freeze the active memtable once it holds this many bytes (default: 4MB)
    pub memtable_size_limit: usize,
    /// Size ratio between adjacent levels (default: 10)
    pub level_fanout: usize,
    /// Target data block size (default: 4KB)
    pub block_size: usize,
    /// Bloom filter bits per key; 0 disables filters (default: 10, ~1% FPR)
    pub bloom_bits_per_key: usize,
    /// Compaction write budget in bytes/s; None = unthrottled
    pub compaction_throughput_limit: Option<u64>,
    /// L0 segment count that triggers L0 → L1 compaction (default: 4)
    pub l0_compaction_trigger: usize,
    /// Byte budget of L1; deeper levels grow by `level_fanout` (default: 10MB)
    pub level1_max_bytes: u64,
    /// Number of levels including L0 (default: 7)
    pub max_levels: usize,
    /// Split compaction output at this size (default: 2MB)
    pub target_segment_size: u64,
    /// Rotate the WAL file past this size (default: 64MB)
    pub wal_max_file_size: u64,
    pub wal_sync: SyncPolicy,
    /// Block cache capacity in bytes; 0 disables the cache (default: 8MB)
    pub block_cache_capacity: usize,
    pub block_cache_shards: usize,
    pub tombstone_policy: TombstonePolicy,
    /// How often the compactor checks for work (default: 1s)
    pub compaction_interval: Duration,
    /// How often the flusher checks for frozen memtables (default: 100ms)
    pub flush_interval: Duration,
    /// Run flush and compaction on background threads (default: true).
    /// When false, callers drive them through `DB::flush` and `DB::compact`.
    pub background_compaction: bool,
    /// Decayed reads per segment that make it hot (default: 64)
    pub hot_read_threshold: u64,
    /// Halve read counters after this many reads (default: 4096)
    pub heat_decay_interval: u64,
}

pub const MIN_BLOCK_SIZE: usize = 256;
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

impl Default for Options {
    fn default() -> Self {
        Options {
            memtable_size_limit: 4 << 20,
            level_fanout: 10,
            block_size: 4 << 10,
            bloom_bits_per_key: 10,
            compaction_throughput_limit: None,
            l0_compaction_trigger: 4,
            level1_max_bytes: 10 << 20,
            max_levels: 7,
            target_segment_size: 2 << 20,
            wal_max_file_size: 64 << 20,
            wal_sync: SyncPolicy::EveryWrite,
            block_cache_capacity: 8 << 20,
            block_cache_shards: 8,
            tombstone_policy: TombstonePolicy::LastLevel,
            compaction_interval: Duration::from_secs(1),
            flush_interval: Duration::from_millis(100),
            background_compaction: true,
            hot_read_threshold: 64,
            heat_decay_interval: 4096,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memtable_size_limit(mut self, bytes: usize) -> Self {
        self.memtable_size_limit = bytes;
        self
    }

    pub fn with_level_fanout(mut self, fanout: usize) -> Self {
        self.level_fanout = fanout;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn with_bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn with_compaction_throughput_limit(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.compaction_throughput_limit = bytes_per_sec;
        self
    }

    pub fn with_l0_compaction_trigger(mut self, segments: usize) -> Self {
        self.l0_compaction_trigger = segments;
        self
    }

    pub fn with_level1_max_bytes(mut self, bytes: u64) -> Self {
        self.level1_max_bytes = bytes;
        self
    }

    pub fn with_max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn with_target_segment_size(mut self, bytes: u64) -> Self {
        self.target_segment_size = bytes;
        self
    }

    pub fn with_wal_max_file_size(mut self, bytes: u64) -> Self {
        self.wal_max_file_size = bytes;
        self
    }

    pub fn with_wal_sync(mut self, policy: SyncPolicy) -> Self {
        self.wal_sync = policy;
        self
    }

    pub fn with_block_cache(mut self, capacity: usize, shards: usize) -> Self {
        self.block_cache_capacity = capacity;
        self.block_cache_shards = shards;
        self
    }

    pub fn with_tombstone_policy(mut self, policy: TombstonePolicy) -> Self {
        self.tombstone_policy = policy;
        self
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_background_compaction(mut self, enabled: bool) -> Self {
        self.background_compaction = enabled;
        self
    }

    pub fn with_tiering(mut self, hot_read_threshold: u64, heat_decay_interval: u64) -> Self {
        self.hot_read_threshold = hot_read_threshold;
        self.heat_decay_interval = heat_decay_interval;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(Error::InvalidArgument(msg))
        }

        if self.memtable_size_limit == 0 {
            return invalid("memtable_size_limit must be > 0".into());
        }
        if self.level_fanout < 2 {
            return invalid(format!("level_fanout must be >= 2, got {}", self.level_fanout));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return invalid(format!(
                "block_size must be within {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}, got {}",
                self.block_size
            ));
        }
        if self.compaction_throughput_limit == Some(0) {
            return invalid("compaction_throughput_limit must be > 0 when set".into());
        }
        if self.l0_compaction_trigger == 0 {
            return invalid("l0_compaction_trigger must be > 0".into());
        }
        if self.level1_max_bytes == 0 || self.target_segment_size == 0 {
            return invalid("level1_max_bytes and target_segment_size must be > 0".into());
        }
        if !(2..=32).contains(&self.max_levels) {
            return invalid(format!("max_levels must be within 2..=32, got {}", self.max_levels));
        }
        if self.wal_max_file_size == 0 {
            return invalid("wal_max_file_size must be > 0".into());
        }
        if self.wal_sync == SyncPolicy::EveryNWrites(0) {
            return invalid("EveryNWrites needs n > 0".into());
        }
        if self.block_cache_shards == 0 {
            return invalid("block_cache_shards must be > 0".into());
        }
        if self.compaction_interval.is_zero() || self.flush_interval.is_zero() {
            return invalid("background intervals must be non-zero".into());
        }
        Ok(())
    }
}

/// Per-read settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Abandon the read with `Error::Timeout` once this instant passes.
    pub deadline: Option<Instant>,
}

impl ReadOptions {
    pub fn with_deadline(deadline: Instant) -> Self {
        ReadOptions {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }
}
