use std::sync::Arc;

use crate::compaction::tiering::{HeatMap, PlacementDecision};
use crate::manifest::Version;
use crate::segment::Segment;

/// Why a task was selected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompactionReason {
    /// L0 reached its segment-count trigger or byte budget.
    L0Trigger { segments: usize, bytes: u64 },
    /// A sorted level grew past its byte budget.
    OverBudget { bytes: u64, budget: u64 },
    /// The level is within budget; the heat map asked for this move.
    Placement(PlacementDecision),
}

/// One unit of compaction work: merge `inputs` (from `source_level`) with
/// the `overlapping` segments of `target_level`.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    pub source_level: usize,
    pub target_level: usize,
    /// Source-level inputs, newest first.
    pub inputs: Vec<Arc<Segment>>,
    /// Target-level segments whose ranges intersect the inputs.
    pub overlapping: Vec<Arc<Segment>>,
    pub reason: CompactionReason,
}

impl CompactionTask {
    /// All inputs in merge priority order (newest data first).
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.inputs.iter().chain(self.overlapping.iter())
    }

    /// `(level, id)` of every input, as recorded in the manifest edit.
    pub fn removed(&self) -> Vec<(u32, u64)> {
        self.inputs
            .iter()
            .map(|s| (self.source_level as u32, s.id()))
            .chain(self.overlapping.iter().map(|s| (self.target_level as u32, s.id())))
            .collect()
    }

    pub fn input_bytes(&self) -> u64 {
        self.all_inputs().map(|s| s.file_size()).sum()
    }
}

/// Chooses the next compaction from a version.
///
/// Score per level: L0 uses max(count / trigger, bytes / L1 budget); level
/// n >= 1 uses bytes / budget(n) with budget(n) = L1 × fanout^(n-1). The
/// highest score >= 1 wins. The last level is never a source.
#[derive(Debug)]
pub struct Picker {
    l0_trigger: usize,
    level1_max_bytes: u64,
    fanout: u64,
    num_levels: usize,
    /// Per level: max key of the last segment compacted out of it.
    pointers: Vec<Option<Vec<u8>>>,
}

impl Picker {
    pub fn new(l0_trigger: usize, level1_max_bytes: u64, fanout: usize, num_levels: usize) -> Self {
        Picker {
            l0_trigger: l0_trigger.max(1),
            level1_max_bytes: level1_max_bytes.max(1),
            fanout: fanout.max(2) as u64,
            num_levels: num_levels.max(2),
            pointers: vec![None; num_levels.max(2)],
        }
    }

    /// Byte budget of `level`. L0 shares L1's budget for its byte trigger.
    pub fn level_budget(&self, level: usize) -> u64 {
        let exp = level.saturating_sub(1) as u32;
        self.fanout
            .checked_pow(exp)
            .and_then(|mult| mult.checked_mul(self.level1_max_bytes))
            .unwrap_or(u64::MAX)
    }

    fn score(&self, version: &Version, level: usize) -> f64 {
        let bytes = version.level_bytes(level) as f64;
        if level == 0 {
            let count = version.level(0).len() as f64 / self.l0_trigger as f64;
            count.max(bytes / self.level1_max_bytes as f64)
        } else {
            bytes / self.level_budget(level) as f64
        }
    }

    /// Size-driven pick first; if nothing is over budget, ask the heat map
    /// for a placement move.
    pub fn pick(&mut self, version: &Version, heat: &HeatMap) -> Option<CompactionTask> {
        let last = self.num_levels.min(version.num_levels()) - 1;

        let best = (0..last)
            .map(|level| (level, self.score(version, level)))
            .filter(|(level, score)| *score >= 1.0 && !version.level(*level).is_empty())
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((level, _)) = best {
            return Some(if level == 0 {
                self.pick_l0(version)
            } else {
                self.pick_over_budget(version, level, heat)
            });
        }
        self.pick_placement(version, heat, last)
    }

    fn pick_l0(&self, version: &Version) -> CompactionTask {
        let inputs: Vec<Arc<Segment>> = version.level(0).to_vec();
        let (min, max) = key_span(&inputs);
        CompactionTask {
            source_level: 0,
            target_level: 1,
            overlapping: version.overlapping(1, &min, &max),
            reason: CompactionReason::L0Trigger {
                segments: inputs.len(),
                bytes: version.level_bytes(0),
            },
            inputs,
        }
    }

    /// Coldest segment of the level; equal heat goes round-robin from the
    /// level's compaction pointer.
    fn pick_over_budget(&mut self, version: &Version, level: usize, heat: &HeatMap) -> CompactionTask {
        let segments = version.level(level);
        let heats: Vec<f64> = segments.iter().map(|s| heat.heat(s.id())).collect();
        let coldest = heats.iter().copied().fold(f64::INFINITY, f64::min);

        let pointer = self.pointers[level].as_deref();
        let tied = || {
            segments
                .iter()
                .zip(&heats)
                .filter(move |(_, h)| **h <= coldest)
                .map(|(s, _)| s)
        };
        let chosen = tied()
            .find(|s| pointer.is_none_or(|p| s.meta().min_key.as_slice() > p))
            .or_else(|| tied().next())
            .unwrap_or(&segments[0]);

        self.pointers[level] = Some(chosen.meta().max_key.clone());
        self.task_for(version, level, level + 1, Arc::clone(chosen), CompactionReason::OverBudget {
            bytes: version.level_bytes(level),
            budget: self.level_budget(level),
        })
    }

    fn pick_placement(&mut self, version: &Version, heat: &HeatMap, last: usize) -> Option<CompactionTask> {
        for level in 1..last {
            for segment in version.level(level) {
                if let decision @ PlacementDecision::Demote { target_level } =
                    heat.placement(segment.id(), level, last + 1)
                {
                    let task = self.task_for(
                        version,
                        level,
                        target_level,
                        Arc::clone(segment),
                        CompactionReason::Placement(decision),
                    );
                    return Some(task);
                }
            }
        }
        None
    }

    fn task_for(
        &self,
        version: &Version,
        source_level: usize,
        target_level: usize,
        segment: Arc<Segment>,
        reason: CompactionReason,
    ) -> CompactionTask {
        let overlapping = version.overlapping(target_level, &segment.meta().min_key, &segment.meta().max_key);
        CompactionTask {
            source_level,
            target_level,
            inputs: vec![segment],
            overlapping,
            reason,
        }
    }
}

/// Smallest min key and largest max key over `segments`.
fn key_span(segments: &[Arc<Segment>]) -> (Vec<u8>, Vec<u8>) {
    let min = segments.iter().map(|s| &s.meta().min_key).min().cloned().unwrap_or_default();
    let max = segments.iter().map(|s| &s.meta().max_key).max().cloned().unwrap_or_default();
    (min, max)
}
