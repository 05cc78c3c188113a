//! Leveled compaction.
//!
//! One cycle walks an explicit state machine:
//!
//! ```text
//! Idle → Selecting → Merging → Installing → Idle
//!            │           │           │
//!            └─ nothing  └─ error    └─ error
//!               to do       (outputs    (outputs
//!                            deleted)    deleted)
//! ```
//!
//! Merge output goes to fresh segment files that no version references, so
//! a failure or crash before Installing leaves the live level set untouched;
//! leftover files are orphans and are removed at the next open.

pub mod picker;
pub mod throttle;
pub mod tiering;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub use picker::{CompactionReason, CompactionTask, Picker};
pub use throttle::RateLimiter;
pub use tiering::{HeatMap, PlacementDecision, Temperature};

use crate::db::options::{Options, TombstonePolicy};
use crate::error::Result;
use crate::iterator::{BoxedIterator, MergeIterator, StorageIterator};
use crate::manifest::Version;
use crate::segment::{Segment, SegmentBuilder, SegmentMeta};
use crate::types::SequenceNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Selecting,
    Merging,
    Installing,
}

/// What the compactor needs from the engine.
pub trait CompactionHost {
    /// The version to select from.
    fn current_version(&self) -> Arc<Version>;
    fn heat_map(&self) -> &HeatMap;
    fn allocate_segment_id(&self) -> u64;
    /// Where a new segment file goes.
    fn segment_path(&self, level: u32, id: u64) -> PathBuf;
    fn open_segment(&self, path: &std::path::Path) -> Result<Arc<Segment>>;
    /// Highest sequence handed out so far.
    fn latest_sequence(&self) -> SequenceNumber;
    /// Atomically replace the task's inputs with `added` in the manifest
    /// and the published version.
    fn install(&self, task: &CompactionTask, added: Vec<Arc<Segment>>) -> Result<()>;
}

/// Summary of one finished cycle.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub source_level: usize,
    pub target_level: usize,
    pub reason: CompactionReason,
    pub inputs: usize,
    pub outputs: Vec<SegmentMeta>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub entries_written: u64,
    /// Tombstones discarded because nothing older could sit beneath them.
    pub tombstones_dropped: u64,
}

pub struct Compactor {
    state: CompactionState,
    picker: Picker,
    limiter: Option<RateLimiter>,
    num_levels: usize,
    block_size: usize,
    bloom_bits_per_key: usize,
    target_segment_size: u64,
    tombstone_policy: TombstonePolicy,
}

impl Compactor {
    pub fn new(options: &Options) -> Self {
        Compactor {
            state: CompactionState::Idle,
            picker: Picker::new(
                options.l0_compaction_trigger,
                options.level1_max_bytes,
                options.level_fanout,
                options.max_levels,
            ),
            limiter: options.compaction_throughput_limit.map(RateLimiter::new),
            num_levels: options.max_levels,
            block_size: options.block_size,
            bloom_bits_per_key: options.bloom_bits_per_key,
            target_segment_size: options.target_segment_size,
            tombstone_policy: options.tombstone_policy,
        }
    }

    pub fn state(&self) -> CompactionState {
        self.state
    }

    /// Run one full cycle. `Ok(None)` means there was nothing to do.
    pub fn run_cycle(&mut self, host: &dyn CompactionHost) -> Result<Option<CompactionOutcome>> {
        self.state = CompactionState::Selecting;
        let version = host.current_version();
        let Some(task) = self.picker.pick(&version, host.heat_map()) else {
            self.state = CompactionState::Idle;
            return Ok(None);
        };

        let result = self.execute(host, &version, task);
        self.state = CompactionState::Idle;
        result.map(Some)
    }

    fn execute(&mut self, host: &dyn CompactionHost, version: &Version, task: CompactionTask) -> Result<CompactionOutcome> {
        let started = Instant::now();
        tracing::info!(
            source_level = task.source_level,
            target_level = task.target_level,
            inputs = task.inputs.len(),
            overlapping = task.overlapping.len(),
            reason = ?task.reason,
            "compaction started"
        );

        self.state = CompactionState::Merging;
        let merged = self.merge(host, version, &task)?;

        self.state = CompactionState::Installing;
        let mut added = Vec::with_capacity(merged.outputs.len());
        for (path, _) in &merged.outputs {
            match host.open_segment(path) {
                Ok(segment) => added.push(segment),
                Err(e) => {
                    discard_outputs(added, &merged.outputs);
                    return Err(e);
                }
            }
        }
        if let Err(e) = host.install(&task, added.clone()) {
            discard_outputs(added, &merged.outputs);
            return Err(e);
        }

        let outcome = CompactionOutcome {
            source_level: task.source_level,
            target_level: task.target_level,
            reason: task.reason,
            inputs: task.inputs.len() + task.overlapping.len(),
            outputs: merged.outputs.into_iter().map(|(_, meta)| meta).collect(),
            bytes_read: task.input_bytes(),
            bytes_written: merged.bytes_written,
            entries_written: merged.entries_written,
            tombstones_dropped: merged.tombstones_dropped,
        };
        tracing::info!(
            source_level = outcome.source_level,
            target_level = outcome.target_level,
            outputs = outcome.outputs.len(),
            bytes_read = outcome.bytes_read,
            bytes_written = outcome.bytes_written,
            tombstones_dropped = outcome.tombstones_dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(outcome)
    }

    /// k-way merge of the task's inputs into new segments at the target level.
    fn merge(&mut self, host: &dyn CompactionHost, version: &Version, task: &CompactionTask) -> Result<Merged> {
        let mut sources: Vec<BoxedIterator> = Vec::new();
        for segment in task.all_inputs() {
            sources.push(Box::new(segment.iter()?));
        }
        let mut iter = MergeIterator::new(sources);

        let mut merged = Merged::default();
        let mut builder: Option<SegmentBuilder> = None;

        if let Err(e) = self.write_outputs(host, version, task.target_level, &mut iter, &mut builder, &mut merged) {
            if let Some(partial) = builder.take() {
                partial.abandon();
            }
            for (path, _) in &merged.outputs {
                remove_quietly(path);
            }
            tracing::error!(
                source_level = task.source_level,
                target_level = task.target_level,
                error = %e,
                "compaction merge failed"
            );
            return Err(e);
        }
        Ok(merged)
    }

    fn write_outputs(
        &mut self,
        host: &dyn CompactionHost,
        version: &Version,
        target: usize,
        iter: &mut MergeIterator,
        builder: &mut Option<SegmentBuilder>,
        merged: &mut Merged,
    ) -> Result<()> {
        let latest = host.latest_sequence();
        let mut throttled_up_to = 0u64;

        while iter.is_valid() {
            if iter.is_tombstone() && self.can_drop_tombstone(version, target, iter.key(), iter.sequence(), latest) {
                merged.tombstones_dropped += 1;
                iter.next()?;
                continue;
            }

            if builder.is_none() {
                *builder = Some(self.open_output(host, target)?);
                throttled_up_to = 0;
            }
            if let Some(current) = builder.as_mut() {
                current.add(iter.key(), iter.value(), iter.sequence(), iter.value_type())?;
                merged.entries_written += 1;

                let written = current.bytes_written();
                if let Some(limiter) = self.limiter.as_mut() {
                    if written > throttled_up_to {
                        limiter.acquire(written - throttled_up_to);
                        throttled_up_to = written;
                    }
                }
            }

            let full = builder
                .as_ref()
                .is_some_and(|b| b.estimated_size() >= self.target_segment_size);
            if full {
                if let Some(done) = builder.take() {
                    merged.finish(done)?;
                }
            }
            iter.next()?;
        }

        if let Some(last) = builder.take() {
            merged.finish(last)?;
        }
        Ok(())
    }

    fn open_output(&self, host: &dyn CompactionHost, level: usize) -> Result<SegmentBuilder> {
        let id = host.allocate_segment_id();
        let path = host.segment_path(level as u32, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        SegmentBuilder::new(&path, id, level as u32, self.block_size, self.bloom_bits_per_key)
    }

    /// A tombstone may go once nothing older can be hiding underneath it.
    fn can_drop_tombstone(
        &self,
        version: &Version,
        target_level: usize,
        key: &[u8],
        sequence: SequenceNumber,
        latest: SequenceNumber,
    ) -> bool {
        match self.tombstone_policy {
            TombstonePolicy::LastLevel => target_level + 1 >= self.num_levels,
            TombstonePolicy::Grace { retain_sequences } => {
                !version.deeper_levels_contain(target_level, key)
                    && sequence.saturating_add(retain_sequences) <= latest
            }
        }
    }
}

#[derive(Default)]
struct Merged {
    outputs: Vec<(PathBuf, SegmentMeta)>,
    bytes_written: u64,
    entries_written: u64,
    tombstones_dropped: u64,
}

impl Merged {
    fn finish(&mut self, builder: SegmentBuilder) -> Result<()> {
        let path = builder.path().to_path_buf();
        let meta = builder.finish()?;
        self.bytes_written += meta.file_size;
        self.outputs.push((path, meta));
        Ok(())
    }
}

/// Delete outputs that never made it into a version.
fn discard_outputs(opened: Vec<Arc<Segment>>, outputs: &[(PathBuf, SegmentMeta)]) {
    for segment in &opened {
        segment.mark_obsolete();
    }
    drop(opened);
    for (path, _) in outputs {
        if path.exists() {
            remove_quietly(path);
        }
    }
}

fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete compaction output");
    }
}
