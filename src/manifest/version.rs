use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::manifest::edit::VersionEdit;
use crate::segment::{Segment, SegmentMeta};
use crate::types::SequenceNumber;

/// The level set as recorded in the manifest: metadata only, no open files.
/// Rebuilt by replaying edits at open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelSet {
    levels: Vec<Vec<SegmentMeta>>,
    pub next_segment_id: u64,
    pub flushed_sequence: SequenceNumber,
}

impl LevelSet {
    pub fn new() -> Self {
        LevelSet {
            levels: Vec::new(),
            next_segment_id: 1,
            flushed_sequence: 0,
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        match edit {
            VersionEdit::Snapshot {
                segments,
                next_segment_id,
                flushed_sequence,
            } => {
                self.levels.clear();
                for meta in segments {
                    self.add(meta.clone());
                }
                self.next_segment_id = *next_segment_id;
                self.flushed_sequence = *flushed_sequence;
            }

            VersionEdit::Flush {
                segment,
                flushed_sequence,
                next_segment_id,
            } => {
                self.add(segment.clone());
                self.flushed_sequence = self.flushed_sequence.max(*flushed_sequence);
                self.next_segment_id = self.next_segment_id.max(*next_segment_id);
            }

            VersionEdit::Compaction {
                removed,
                added,
                next_segment_id,
            } => {
                for (level, id) in removed {
                    let segments = self
                        .levels
                        .get_mut(*level as usize)
                        .ok_or_else(|| Error::corruption(format!("compaction removes from missing level {level}")))?;
                    let before = segments.len();
                    segments.retain(|m| m.id != *id);
                    if segments.len() == before {
                        return Err(Error::corruption(format!(
                            "compaction removes unknown segment {id} at level {level}"
                        )));
                    }
                }
                for meta in added {
                    self.add(meta.clone());
                }
                self.next_segment_id = self.next_segment_id.max(*next_segment_id);
            }
        }
        Ok(())
    }

    fn add(&mut self, meta: SegmentMeta) {
        let level = meta.level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        self.levels[level].push(meta);
    }

    /// Every live segment, shallowest level first.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.levels.iter().flatten()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn contains(&self, level: u32, id: u64) -> bool {
        self.levels
            .get(level as usize)
            .is_some_and(|segments| segments.iter().any(|m| m.id == id))
    }

    /// One edit that recreates this level set on its own.
    pub fn snapshot(&self) -> VersionEdit {
        VersionEdit::Snapshot {
            segments: self.segments().cloned().collect(),
            next_segment_id: self.next_segment_id,
            flushed_sequence: self.flushed_sequence,
        }
    }
}

/// An immutable snapshot of the live segments per level.
///
/// Readers clone the `Arc<Version>` once and use it for the whole operation;
/// flush and compaction publish a new `Version` instead of editing this one.
///
/// Level 0 is ordered newest first and may overlap. Every deeper level is
/// sorted by key and its segments never overlap.
#[derive(Debug, Clone)]
pub struct Version {
    levels: Vec<Vec<Arc<Segment>>>,
    generation: u64,
}

impl Version {
    pub fn new(num_levels: usize) -> Self {
        Version {
            levels: vec![Vec::new(); num_levels.max(1)],
            generation: 0,
        }
    }

    /// Build from opened segments in any order.
    pub fn from_segments(num_levels: usize, segments: Vec<Arc<Segment>>) -> Result<Self> {
        let mut version = Version::new(num_levels);
        for segment in segments {
            let level = segment.level() as usize;
            let slot = version.levels.get_mut(level).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "segment {} is at level {level} but only {num_levels} levels are configured",
                    segment.id()
                ))
            })?;
            slot.push(segment);
        }
        version.normalize();
        Ok(version)
    }

    fn normalize(&mut self) {
        if let Some(l0) = self.levels.first_mut() {
            // Segment ids are allocated in flush order: higher = newer.
            l0.sort_by_key(|s| std::cmp::Reverse(s.id()));
        }
        for level in self.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.meta().min_key.cmp(&b.meta().min_key));
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &[Arc<Segment>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn levels(&self) -> &[Vec<Arc<Segment>>] {
        &self.levels
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.level(level).iter().map(|s| s.file_size()).sum()
    }

    pub fn total_segments(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Segments at `level` whose key range intersects [start, end].
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<Segment>> {
        self.level(level)
            .iter()
            .filter(|s| s.meta().overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Whether any level below `level` has a segment whose range covers `key`.
    pub fn deeper_levels_contain(&self, level: usize, key: &[u8]) -> bool {
        (level + 1..self.levels.len()).any(|deeper| self.find_in_level(deeper, key).is_some())
    }

    /// The one segment at a sorted level (>= 1) whose range covers `key`.
    pub fn find_in_level(&self, level: usize, key: &[u8]) -> Option<&Arc<Segment>> {
        let segments = self.level(level);
        let idx = segments.partition_point(|s| s.meta().max_key.as_slice() < key);
        segments.get(idx).filter(|s| s.meta().contains_key(key))
    }

    /// Segments that may hold `key`, newest data first: all of L0 in flush
    /// order, then at most one segment per deeper level.
    pub fn candidates(&self, key: &[u8]) -> Vec<Arc<Segment>> {
        let mut out: Vec<Arc<Segment>> = self
            .level(0)
            .iter()
            .filter(|s| s.meta().contains_key(key))
            .cloned()
            .collect();
        for level in 1..self.levels.len() {
            if let Some(segment) = self.find_in_level(level, key) {
                out.push(Arc::clone(segment));
            }
        }
        out
    }

    /// Every segment, in the order a merge should rank them (newest first).
    pub fn all_segments(&self) -> Vec<Arc<Segment>> {
        self.levels.iter().flatten().cloned().collect()
    }

    /// A new version with `segment` added as the newest L0 segment.
    pub fn with_flushed(&self, segment: Arc<Segment>) -> Version {
        let mut next = self.clone();
        next.levels[0].insert(0, segment);
        next.generation += 1;
        next
    }

    /// A new version with the `removed` ids gone and `added` placed by level.
    pub fn with_compaction(&self, removed: &[(u32, u64)], added: Vec<Arc<Segment>>) -> Result<Version> {
        let removed: HashSet<(u32, u64)> = removed.iter().copied().collect();
        let mut next = self.clone();
        for (level, segments) in next.levels.iter_mut().enumerate() {
            segments.retain(|s| !removed.contains(&(level as u32, s.id())));
        }
        for segment in added {
            let level = segment.level() as usize;
            next.levels
                .get_mut(level)
                .ok_or_else(|| Error::InvalidArgument(format!("no level {level}")))?
                .push(segment);
        }
        next.normalize();
        next.generation += 1;
        Ok(next)
    }
}
