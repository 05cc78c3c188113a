//! Hot/cold placement.
//!
//! Reads are counted per segment with counters that halve every
//! `decay_interval` reads. The counts only steer which whole segment the
//! compactor picks next and whether an otherwise idle compactor pushes a
//! cold segment one level down; they never create a second copy of a key.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

/// What the compactor should do with one segment's key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementDecision {
    /// Leave the range where it is.
    Retain,
    /// Merge the range into `target_level`.
    Demote { target_level: usize },
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    heat: f64,
    /// Decay epoch in which the segment was first seen.
    born: u64,
}

#[derive(Debug, Default)]
struct HeatState {
    counters: HashMap<u64, Counter>,
    reads_since_decay: u64,
    epoch: u64,
}

/// Per-segment decayed read counters.
#[derive(Debug)]
pub struct HeatMap {
    state: Mutex<HeatState>,
    hot_threshold: f64,
    decay_interval: u64,
}

impl HeatMap {
    /// A segment read at least `hot_threshold` times (after decay) is hot.
    /// Counters halve every `decay_interval` recorded reads.
    pub fn new(hot_threshold: u64, decay_interval: u64) -> Self {
        HeatMap {
            state: Mutex::new(HeatState::default()),
            hot_threshold: hot_threshold.max(1) as f64,
            decay_interval: decay_interval.max(1),
        }
    }

    /// Start tracking a newly installed segment.
    pub fn register(&self, segment_id: u64) {
        let mut state = self.state.lock();
        let born = state.epoch;
        state
            .counters
            .entry(segment_id)
            .or_insert(Counter { heat: 0.0, born });
    }

    /// Stop tracking a removed segment.
    pub fn forget(&self, segment_id: u64) {
        self.state.lock().counters.remove(&segment_id);
    }

    /// Count one read that had to consult `segment_id`.
    pub fn record_read(&self, segment_id: u64) {
        let mut state = self.state.lock();
        let born = state.epoch;
        state
            .counters
            .entry(segment_id)
            .or_insert(Counter { heat: 0.0, born })
            .heat += 1.0;

        state.reads_since_decay += 1;
        if state.reads_since_decay >= self.decay_interval {
            state.reads_since_decay = 0;
            state.epoch += 1;
            for counter in state.counters.values_mut() {
                counter.heat /= 2.0;
            }
        }
    }

    pub fn heat(&self, segment_id: u64) -> f64 {
        self.state
            .lock()
            .counters
            .get(&segment_id)
            .map_or(0.0, |c| c.heat)
    }

    /// Hot at or above the threshold. Cold once the segment has lived
    /// through at least one decay period while receiving (almost) no reads.
    /// Everything else, including segments too new to judge, is warm.
    pub fn temperature(&self, segment_id: u64) -> Temperature {
        let state = self.state.lock();
        let Some(counter) = state.counters.get(&segment_id) else {
            return Temperature::Warm;
        };
        if counter.heat >= self.hot_threshold {
            Temperature::Hot
        } else if counter.heat < 1.0 && state.epoch > counter.born {
            Temperature::Cold
        } else {
            Temperature::Warm
        }
    }

    /// Placement for a segment at `level` when the compactor has nothing
    /// size-driven to do. Cold segments at levels >= 1 move one level down;
    /// L0 is drained by the size trigger and the last level has nowhere to go.
    pub fn placement(&self, segment_id: u64, level: usize, num_levels: usize) -> PlacementDecision {
        if level == 0 || level + 1 >= num_levels {
            return PlacementDecision::Retain;
        }
        match self.temperature(segment_id) {
            Temperature::Cold => PlacementDecision::Demote { target_level: level + 1 },
            Temperature::Hot | Temperature::Warm => PlacementDecision::Retain,
        }
    }

    /// Number of segments currently tracked.
    pub fn len(&self) -> usize {
        self.state.lock().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
