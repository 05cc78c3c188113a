use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::cache::BlockCache;
use crate::compaction::{CompactionHost, CompactionOutcome, CompactionTask, Compactor, HeatMap};
use crate::db::options::{Options, ReadOptions};
use crate::db::scan::ScanIter;
use crate::db::state::LsmState;
use crate::db::stats::{Counters, LevelStats, Stats};
use crate::error::{Error, Result};
use crate::iterator::{BoxedIterator, MergeIterator, StorageIterator};
use crate::manifest::{Manifest, Version, VersionEdit};
use crate::memtable::MemTable;
use crate::segment::{Segment, SegmentBuilder, SegmentLookup, SegmentMeta, segment_path};
use crate::types::{SequenceNumber, Value};
use crate::wal::{WALManager, WALRecord};

/// State owned by the single writer.
pub(crate) struct WriterState {
    pub wal: WALManager,
}

/// Shared engine internals. `DB` and the background threads hold it by `Arc`.
pub(crate) struct DbInner {
    pub root: PathBuf,
    pub options: Options,
    pub state: RwLock<Arc<LsmState>>,
    /// WAL append, memtable insert and freeze happen under this lock.
    pub writer: Mutex<WriterState>,
    /// Serializes manifest edits; held across the matching state swap.
    pub manifest: Mutex<Manifest>,
    /// One flush at a time, oldest frozen table first.
    pub flush_lock: Mutex<()>,
    pub compactor: Mutex<Compactor>,
    pub cache: Arc<BlockCache>,
    pub heat: HeatMap,
    pub counters: Counters,
    pub next_segment_id: AtomicU64,
    pub next_memtable_id: AtomicU64,
    /// Highest sequence whose write is fully applied to the memtable.
    pub visible_sequence: AtomicU64,
    /// Set by a `Capacity` failure in flush or compaction.
    pub write_halt: Mutex<Option<String>>,
    pub closed: AtomicBool,
    pub flush_signal: Sender<()>,
}

impl DbInner {
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<LsmState> {
        Arc::clone(&self.state.read())
    }

    // ====================================================================
    // Writes
    // ====================================================================

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!("value of {} bytes is too large", value.len())));
        }
        self.write(key, value, WALRecord::put(key.to_vec(), value.to_vec()))?;
        Counters::bump(&self.counters.puts);
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, &[], WALRecord::delete(key.to_vec()))?;
        Counters::bump(&self.counters.deletes);
        Ok(())
    }

    /// WAL first, memtable second. A WAL failure returns before the
    /// memtable is touched.
    fn write(&self, key: &[u8], value: &[u8], record: WALRecord) -> Result<()> {
        self.check_open()?;
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds {} bytes",
                key.len(),
                u16::MAX
            )));
        }
        if let Some(reason) = self.write_halt.lock().as_ref() {
            return Err(Error::Capacity(reason.clone()));
        }

        let is_delete = record.record_type == crate::types::ValueType::Delete;
        let mut writer = self.writer.lock();
        let sequence = writer.wal.append(record)?;

        let active = Arc::clone(&self.state.read().active);
        if is_delete {
            active.delete(key, sequence);
        } else {
            active.put(key, value, sequence);
        }
        self.visible_sequence.store(sequence, Ordering::Release);
        Counters::add(&self.counters.user_bytes, (key.len() + value.len()) as u64);

        if active.is_full() {
            // The write itself is durable; a failed freeze is retried on the
            // next write.
            if let Err(e) = self.freeze(&mut writer) {
                tracing::error!(error = %e, "failed to freeze memtable");
            }
        }
        Ok(())
    }

    /// Swap in an empty memtable and queue the old one for flush.
    /// No-op when the active table is empty.
    pub fn freeze(&self, writer: &mut WriterState) -> Result<()> {
        if self.state.read().active.is_empty() {
            return Ok(());
        }
        writer.wal.rotate()?;
        let wal_floor = writer.wal.active_id();
        let next = Arc::new(MemTable::new(
            self.next_memtable_id.fetch_add(1, Ordering::Relaxed),
            self.options.memtable_size_limit,
        ));

        let frozen_id = {
            let mut guard = self.state.write();
            let frozen_id = guard.active.id();
            *guard = Arc::new(guard.with_frozen(next, wal_floor));
            frozen_id
        };
        tracing::debug!(memtable_id = frozen_id, wal_floor, "froze memtable");
        let _ = self.flush_signal.try_send(());
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        self.writer.lock().wal.flush()
    }

    // ====================================================================
    // Reads
    // ====================================================================

    pub fn get(&self, key: &[u8], options: &ReadOptions) -> Result<Option<Value>> {
        self.check_open()?;
        options.check()?;
        Counters::bump(&self.counters.gets);

        let read_sequence = self.visible_sequence.load(Ordering::Acquire);
        let state = self.snapshot();

        if let Some(entry) = state.active.lookup(key, read_sequence) {
            return Ok(entry.into_value());
        }
        for frozen in &state.immutable {
            if let Some(entry) = frozen.table.lookup(key, read_sequence) {
                return Ok(entry.into_value());
            }
        }

        for segment in state.version.candidates(key) {
            options.check()?;
            match segment.lookup(key)? {
                SegmentLookup::Found(entry) => {
                    self.heat.record_read(segment.id());
                    return Ok(entry.into_value());
                }
                SegmentLookup::Filtered => Counters::bump(&self.counters.bloom_skips),
                SegmentLookup::Absent => self.heat.record_read(segment.id()),
            }
        }
        Ok(None)
    }

    pub fn scan(&self, start: &[u8], end: &[u8], options: ReadOptions) -> Result<ScanIter> {
        self.check_open()?;
        options.check()?;
        Counters::bump(&self.counters.scans);

        if start >= end {
            return Ok(ScanIter::new(MergeIterator::new(Vec::new()), start, end, options));
        }

        let read_sequence = self.visible_sequence.load(Ordering::Acquire);
        let state = self.snapshot();

        // Newest source first: active, frozen (newest first), then levels.
        let mut sources: Vec<BoxedIterator> = Vec::new();
        let tables = std::iter::once(&state.active).chain(state.immutable.iter().map(|f| &f.table));
        for table in tables {
            let mut iter = table.iter(read_sequence);
            iter.seek(start)?;
            sources.push(Box::new(iter));
        }
        for level in state.version.levels() {
            for segment in level {
                let meta = segment.meta();
                if meta.min_key.as_slice() < end && meta.max_key.as_slice() >= start {
                    sources.push(Box::new(segment.scan(start, end)?));
                }
            }
        }

        Ok(ScanIter::new(MergeIterator::new(sources), start, end, options))
    }

    // ====================================================================
    // Flush
    // ====================================================================

    /// Write the oldest frozen memtable to an L0 segment and install it.
    /// Returns false when nothing was waiting.
    pub fn flush_oldest(&self) -> Result<bool> {
        let _flushing = self.flush_lock.lock();
        let Some(frozen) = self.snapshot().oldest_frozen().cloned() else {
            return Ok(false);
        };

        let started = Instant::now();
        let table = &frozen.table;
        let id = self.allocate_segment_id();
        let path = segment_path(&self.root, 0, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let meta = match self.write_memtable(table, &path, id) {
            Ok(meta) => meta,
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        };
        let segment = Arc::new(Segment::open(&path, Arc::clone(&self.cache))?);

        {
            let mut manifest = self.manifest.lock();
            let edit = VersionEdit::Flush {
                segment: meta.clone(),
                flushed_sequence: table.max_sequence(),
                next_segment_id: self.next_segment_id.load(Ordering::Acquire),
            };
            if let Err(e) = manifest.log_and_apply(edit) {
                segment.mark_obsolete();
                self.note_failure(&e);
                return Err(e);
            }
            let mut guard = self.state.write();
            let version = guard.version.with_flushed(Arc::clone(&segment));
            *guard = Arc::new(guard.with_flushed(table.id(), version));
        }
        self.heat.register(id);
        self.resume_writes("flush");

        let purged = self.writer.lock().wal.purge_before(frozen.wal_floor)?;
        self.counters.record_flush(meta.file_size);
        tracing::info!(
            segment_id = id,
            memtable_id = table.id(),
            entries = meta.entry_count,
            bytes = meta.file_size,
            wal_files_purged = purged,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed memtable"
        );
        Ok(true)
    }

    fn write_memtable(&self, table: &Arc<MemTable>, path: &Path, id: u64) -> Result<SegmentMeta> {
        let mut builder = SegmentBuilder::new(path, id, 0, self.options.block_size, self.options.bloom_bits_per_key)?;
        if let Err(e) = copy_newest_versions(table, &mut builder) {
            builder.abandon();
            return Err(e);
        }
        builder.finish().inspect_err(|_| {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete unfinished segment");
            }
        })
    }

    /// Freeze whatever is buffered and flush every frozen table.
    pub fn flush_all(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            self.freeze(&mut writer)?;
        }
        while self.flush_oldest()? {}
        Ok(())
    }

    fn note_failure(&self, error: &Error) {
        if let Error::Capacity(reason) = error {
            tracing::error!(reason = %reason, "out of space, halting writes until a flush succeeds");
            *self.write_halt.lock() = Some(reason.clone());
        }
    }

    /// Lift a `Capacity` halt after `what` got data onto disk.
    fn resume_writes(&self, what: &str) {
        if let Some(reason) = self.write_halt.lock().take() {
            tracing::info!(after = what, halted_for = %reason, "space available again, resuming writes");
        }
    }

    // ====================================================================
    // Compaction
    // ====================================================================

    /// Run one compaction cycle, recording the outcome in the counters.
    pub fn compact_once(&self) -> Result<Option<CompactionOutcome>> {
        let mut compactor = self.compactor.lock();
        match compactor.run_cycle(self) {
            Ok(Some(outcome)) => {
                self.counters.record_compaction(&outcome);
                if !outcome.outputs.is_empty() {
                    self.resume_writes("compaction");
                }
                Ok(Some(outcome))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                Counters::bump(&self.counters.compaction_failures);
                self.counters.record_background_error(e.to_string());
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    // ====================================================================
    // Stats
    // ====================================================================

    pub fn stats(&self) -> Stats {
        let state = self.snapshot();
        let mut stats = self.counters.snapshot(self.cache.stats());
        stats.memtable_bytes = state.active.size();
        stats.immutable_memtables = state.immutable.len();
        stats.levels = state
            .version
            .levels()
            .iter()
            .enumerate()
            .map(|(level, segments)| LevelStats {
                segments: segments.len(),
                bytes: state.version.level_bytes(level),
            })
            .collect();
        stats
    }
}

impl CompactionHost for DbInner {
    fn current_version(&self) -> Arc<Version> {
        Arc::clone(&self.state.read().version)
    }

    fn heat_map(&self) -> &HeatMap {
        &self.heat
    }

    fn allocate_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::AcqRel)
    }

    fn segment_path(&self, level: u32, id: u64) -> PathBuf {
        segment_path(&self.root, level, id)
    }

    fn open_segment(&self, path: &Path) -> Result<Arc<Segment>> {
        Ok(Arc::new(Segment::open(path, Arc::clone(&self.cache))?))
    }

    fn latest_sequence(&self) -> SequenceNumber {
        self.visible_sequence.load(Ordering::Acquire)
    }

    fn install(&self, task: &CompactionTask, added: Vec<Arc<Segment>>) -> Result<()> {
        let removed = task.removed();
        let added_ids: Vec<u64> = added.iter().map(|s| s.id()).collect();

        {
            let mut manifest = self.manifest.lock();
            // Only installs change the version, and they all hold the
            // manifest lock, so this version is the one we replace.
            let next = self.current_version().with_compaction(&removed, added.clone())?;
            manifest.log_and_apply(VersionEdit::Compaction {
                removed: removed.clone(),
                added: added.iter().map(|s| s.meta().clone()).collect(),
                next_segment_id: self.next_segment_id.load(Ordering::Acquire),
            })?;
            let mut guard = self.state.write();
            *guard = Arc::new(guard.with_version(next));
        }

        for segment in task.all_inputs() {
            segment.mark_obsolete();
            self.heat.forget(segment.id());
        }
        for id in added_ids {
            self.heat.register(id);
        }
        Ok(())
    }
}

/// One version per key, newest wins; tombstones are kept.
fn copy_newest_versions(table: &Arc<MemTable>, builder: &mut SegmentBuilder) -> Result<()> {
    let source: BoxedIterator = Box::new(table.iter(SequenceNumber::MAX));
    let mut iter = MergeIterator::new(vec![source]);
    while iter.is_valid() {
        builder.add(iter.key(), iter.value(), iter.sequence(), iter.value_type())?;
        iter.next()?;
    }
    Ok(())
}
