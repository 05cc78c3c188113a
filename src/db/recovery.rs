//! Startup: manifest, orphan cleanup, segment opening and WAL replay.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::cache::BlockCache;
use crate::compaction::{Compactor, HeatMap};
use crate::db::inner::{DbInner, WriterState};
use crate::db::options::Options;
use crate::db::state::LsmState;
use crate::db::stats::Counters;
use crate::error::{Error, Result};
use crate::manifest::{LevelSet, Manifest, Version};
use crate::memtable::MemTable;
use crate::segment::{Segment, list_segment_files, segment_path, segments_dir};
use crate::types::ValueType;
use crate::wal::WALManager;

pub(crate) const WAL_DIR: &str = "wal";

impl DbInner {
    pub(crate) fn open(root: &Path, options: Options, flush_signal: Sender<()>) -> Result<DbInner> {
        options.validate()?;
        let started = Instant::now();
        std::fs::create_dir_all(root)?;
        std::fs::create_dir_all(segments_dir(root))?;

        let manifest = Manifest::open(root)?;
        let levels = manifest.levels().clone();
        let highest_on_disk = remove_orphans(root, &levels)?;

        let cache = Arc::new(BlockCache::new(options.block_cache_capacity, options.block_cache_shards));
        let heat = HeatMap::new(options.hot_read_threshold, options.heat_decay_interval);

        let mut segments = Vec::new();
        for meta in levels.segments() {
            let path = segment_path(root, meta.level, meta.id);
            let segment = Segment::open(&path, Arc::clone(&cache))?;
            if segment.id() != meta.id || segment.level() != meta.level {
                return Err(Error::corruption(format!(
                    "{} holds segment {} at level {}, manifest says {} at level {}",
                    path.display(),
                    segment.id(),
                    segment.level(),
                    meta.id,
                    meta.level
                )));
            }
            heat.register(segment.id());
            segments.push(Arc::new(segment));
        }
        let segment_count = segments.len();
        let version = Version::from_segments(options.max_levels, segments)?;

        // WAL: everything newer than the last flush goes back into a memtable.
        let mut wal = WALManager::with_max_file_size(&root.join(WAL_DIR), options.wal_sync, options.wal_max_file_size)?;
        let memtable = Arc::new(MemTable::new(1, options.memtable_size_limit));
        let mut replay = wal.replay()?;
        let mut highest_sequence = levels.flushed_sequence;
        let mut replayed = 0u64;
        for record in replay.by_ref() {
            let record = record?;
            highest_sequence = highest_sequence.max(record.sequence);
            if record.sequence <= levels.flushed_sequence {
                continue;
            }
            match record.record_type {
                ValueType::Put => memtable.put(&record.key, &record.value, record.sequence),
                ValueType::Delete => memtable.delete(&record.key, record.sequence),
            }
            replayed += 1;
        }
        wal.set_next_sequence(highest_sequence + 1);
        if memtable.is_empty() {
            // Every older log is already covered by segments.
            wal.purge_before(wal.active_id())?;
        }

        tracing::info!(
            path = %root.display(),
            segments = segment_count,
            flushed_sequence = levels.flushed_sequence,
            wal_files = replay.files_read(),
            torn_wal_tails = replay.torn_tails(),
            replayed_records = replayed,
            next_sequence = highest_sequence + 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "opened database"
        );

        Ok(DbInner {
            root: root.to_path_buf(),
            state: RwLock::new(Arc::new(LsmState::new(memtable, version))),
            writer: Mutex::new(WriterState { wal }),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            compactor: Mutex::new(Compactor::new(&options)),
            cache,
            heat,
            counters: Counters::default(),
            next_segment_id: AtomicU64::new(levels.next_segment_id.max(highest_on_disk + 1)),
            next_memtable_id: AtomicU64::new(2),
            visible_sequence: AtomicU64::new(highest_sequence),
            write_halt: Mutex::new(None),
            closed: AtomicBool::new(false),
            flush_signal,
            options,
        })
    }
}

/// Delete segment files the manifest does not reference: leftovers of a
/// flush or compaction that crashed before installing. Returns the highest
/// segment id seen on disk so new ids never reuse a file name.
fn remove_orphans(root: &Path, levels: &LevelSet) -> Result<u64> {
    let mut highest = 0;
    for (level, id, path) in list_segment_files(root)? {
        highest = highest.max(id);
        if levels.contains(level, id) {
            continue;
        }
        tracing::warn!(segment_id = id, level, path = %path.display(), "removing orphan segment");
        std::fs::remove_file(&path)?;
    }
    Ok(highest)
}
