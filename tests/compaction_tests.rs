// Compaction: picker scoring, heat-driven placement, tombstone policies,
// throttling, and end-to-end merges through the DB.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tierkv::cache::BlockCache;
use tierkv::compaction::{CompactionReason, HeatMap, Picker, PlacementDecision, RateLimiter, Temperature};
use tierkv::manifest::Version;
use tierkv::segment::{Segment, SegmentBuilder};
use tierkv::types::ValueType;
use tierkv::{DB, Options, TombstonePolicy};

fn segment(dir: &Path, id: u64, level: u32, keys: std::ops::Range<u32>) -> Arc<Segment> {
    let path = dir.join(format!("{id:06}.seg"));
    let mut builder = SegmentBuilder::new(&path, id, level, 4096, 10).unwrap();
    for i in keys {
        let key = format!("key{:05}", i);
        builder.add(key.as_bytes(), b"value", id, ValueType::Put).unwrap();
    }
    builder.finish().unwrap();
    Arc::new(Segment::open(&path, Arc::new(BlockCache::default())).unwrap())
}

fn manual_options() -> Options {
    Options::default()
        .with_background_compaction(false)
        .with_wal_sync(tierkv::wal::SyncPolicy::Manual)
}

fn key(i: u32) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

// =============================================================================
// Picker
// =============================================================================
#[test]
fn l0_trigger_takes_all_of_l0_and_overlapping_l1() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(
        4,
        vec![
            segment(dir.path(), 1, 0, 0..100),
            segment(dir.path(), 2, 0, 50..150),
            segment(dir.path(), 3, 1, 0..40),
            segment(dir.path(), 4, 1, 500..600),
        ],
    )
    .unwrap();

    let mut picker = Picker::new(2, 1 << 30, 10, 4);
    let task = picker.pick(&version, &HeatMap::new(64, 4096)).unwrap();

    assert_eq!((task.source_level, task.target_level), (0, 1));
    assert!(matches!(task.reason, CompactionReason::L0Trigger { segments: 2, .. }));
    // L0 newest first.
    let inputs: Vec<u64> = task.inputs.iter().map(|s| s.id()).collect();
    assert_eq!(inputs, vec![2, 1]);
    let overlapping: Vec<u64> = task.overlapping.iter().map(|s| s.id()).collect();
    assert_eq!(overlapping, vec![3]);
    assert_eq!(task.removed(), vec![(0, 2), (0, 1), (1, 3)]);
}

#[test]
fn below_trigger_picks_nothing() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(4, vec![segment(dir.path(), 1, 0, 0..10)]).unwrap();
    let mut picker = Picker::new(4, 1 << 30, 10, 4);
    assert!(picker.pick(&version, &HeatMap::new(64, 4096)).is_none());
}

#[test]
fn over_budget_level_gives_up_its_coldest_segment() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(
        4,
        vec![segment(dir.path(), 1, 1, 0..100), segment(dir.path(), 2, 1, 100..200)],
    )
    .unwrap();
    let heat = HeatMap::new(1_000, 1_000_000);
    for _ in 0..5 {
        heat.record_read(1);
    }

    let mut picker = Picker::new(4, 1, 10, 4);
    let task = picker.pick(&version, &heat).unwrap();
    assert_eq!((task.source_level, task.target_level), (1, 2));
    assert!(matches!(task.reason, CompactionReason::OverBudget { .. }));
    assert_eq!(task.inputs[0].id(), 2);
}

#[test]
fn equally_cold_segments_rotate_round_robin() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(
        4,
        vec![segment(dir.path(), 1, 1, 0..100), segment(dir.path(), 2, 1, 100..200)],
    )
    .unwrap();
    let heat = HeatMap::new(64, 4096);
    let mut picker = Picker::new(4, 1, 10, 4);

    let first = picker.pick(&version, &heat).unwrap().inputs[0].id();
    let second = picker.pick(&version, &heat).unwrap().inputs[0].id();
    let third = picker.pick(&version, &heat).unwrap().inputs[0].id();
    assert_eq!((first, second, third), (1, 2, 1));
}

#[test]
fn last_level_is_never_a_source() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(2, vec![segment(dir.path(), 1, 1, 0..100)]).unwrap();
    let mut picker = Picker::new(1, 1, 10, 2);
    assert!(picker.pick(&version, &HeatMap::new(64, 4096)).is_none());
}

#[test]
fn cold_segment_within_budget_is_demoted() {
    let dir = tempdir().unwrap();
    let version = Version::from_segments(
        4,
        vec![segment(dir.path(), 1, 1, 0..100), segment(dir.path(), 2, 2, 50..80)],
    )
    .unwrap();
    // Every read decays; segment 1 is never read after an epoch passes.
    let heat = HeatMap::new(1_000, 1);
    heat.register(1);
    heat.register(2);
    heat.record_read(99);

    let mut picker = Picker::new(4, 1 << 30, 10, 4);
    let task = picker.pick(&version, &heat).unwrap();
    assert_eq!(
        task.reason,
        CompactionReason::Placement(PlacementDecision::Demote { target_level: 2 })
    );
    assert_eq!(task.inputs[0].id(), 1);
    assert_eq!(task.overlapping[0].id(), 2);
}

// =============================================================================
// Heat map
// =============================================================================
#[test]
fn temperatures_follow_decayed_reads() {
    let heat = HeatMap::new(4, 10);
    heat.register(1);
    heat.register(2);
    assert_eq!(heat.temperature(1), Temperature::Warm, "too new to judge");

    for _ in 0..10 {
        heat.record_read(1);
    }
    // Tenth read halves every counter: 10 -> 5.
    assert_eq!(heat.heat(1), 5.0);
    assert_eq!(heat.temperature(1), Temperature::Hot);
    assert_eq!(heat.temperature(2), Temperature::Cold);

    heat.register(3);
    assert_eq!(heat.temperature(3), Temperature::Warm);
    assert_eq!(heat.temperature(42), Temperature::Warm, "untracked");
}

#[test]
fn placement_leaves_l0_and_last_level_alone() {
    let heat = HeatMap::new(4, 1);
    heat.register(7);
    heat.record_read(8);
    assert_eq!(heat.temperature(7), Temperature::Cold);

    assert_eq!(heat.placement(7, 0, 4), PlacementDecision::Retain);
    assert_eq!(heat.placement(7, 3, 4), PlacementDecision::Retain);
    assert_eq!(heat.placement(7, 1, 4), PlacementDecision::Demote { target_level: 2 });

    heat.forget(7);
    assert_eq!(heat.placement(7, 1, 4), PlacementDecision::Retain);
    assert_eq!(heat.len(), 1);
}

// =============================================================================
// Throttle
// =============================================================================
#[test]
fn rate_limiter_refills_over_time() {
    let mut limiter = RateLimiter::with_burst(100_000, 1_000);
    assert_eq!(limiter.available(), 1_000);
    assert!(limiter.try_acquire(1_000));
    assert!(!limiter.try_acquire(500));

    std::thread::sleep(Duration::from_millis(20));
    assert!(limiter.available() >= 500);
    assert!(limiter.available() <= 1_000, "capped at burst");
    assert_eq!(limiter.bytes_per_sec(), 100_000);
}

#[test]
fn throughput_limit_slows_compaction() {
    let dir = tempdir().unwrap();
    let db = DB::open(
        dir.path(),
        manual_options()
            .with_l0_compaction_trigger(2)
            .with_compaction_throughput_limit(Some(50_000)),
    )
    .unwrap();

    let value = [b'x'; 100];
    for round in 0..2 {
        for i in 0..1_000 {
            db.put(&key(i + round), &value).unwrap();
        }
        db.flush().unwrap();
    }

    let started = Instant::now();
    let outcomes = db.compact().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].bytes_written > 100_000);
    // ~125KB at 50KB/s with a 50KB burst owes more than a second.
    assert!(started.elapsed() >= Duration::from_secs(1));
}

// =============================================================================
// Through the DB
// =============================================================================
#[test]
fn compaction_preserves_every_live_key() {
    let dir = tempdir().unwrap();
    let db = DB::open(
        dir.path(),
        manual_options()
            .with_l0_compaction_trigger(2)
            .with_level1_max_bytes(16 << 10)
            .with_target_segment_size(8 << 10),
    )
    .unwrap();

    let mut model = BTreeMap::new();
    for round in 0..6u32 {
        for i in 0..800u32 {
            let k = (i * 7 + round * 13) % 1_000;
            if (i + round) % 9 == 0 {
                db.delete(&key(k)).unwrap();
                model.remove(&key(k));
            } else {
                let v = format!("r{}-{}", round, i).into_bytes();
                db.put(&key(k), &v).unwrap();
                model.insert(key(k), v);
            }
        }
        db.flush().unwrap();
        db.compact().unwrap();
    }

    let stats = db.stats();
    assert!(stats.compactions > 0);
    assert_eq!(stats.levels[0].segments, 0, "every compaction drains L0");
    assert!(stats.levels.iter().skip(2).any(|l| l.segments > 0), "data moved past L1");

    for k in 0..1_000 {
        assert_eq!(db.get(&key(k)).unwrap(), model.get(&key(k)).cloned(), "key {}", k);
    }
    let scanned: Vec<(Vec<u8>, Vec<u8>)> = db.scan(b"", b"\xff").unwrap().map(|r| r.unwrap()).collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(scanned, expected);
}

#[test]
fn last_level_policy_drops_tombstones_only_at_the_bottom() {
    // Two levels: L0 -> L1 is a bottom-level compaction.
    let dir = tempdir().unwrap();
    let db = DB::open(
        dir.path(),
        manual_options().with_max_levels(2).with_l0_compaction_trigger(2),
    )
    .unwrap();
    for i in 0..1_000 {
        db.put(&key(i), b"v").unwrap();
    }
    db.flush().unwrap();
    for i in (0..1_000).step_by(2) {
        db.delete(&key(i)).unwrap();
    }
    db.flush().unwrap();

    let outcomes = db.compact().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].tombstones_dropped, 500);
    assert!(outcomes[0].outputs.iter().all(|m| m.tombstone_count == 0));
    assert_eq!(db.get(&key(0)).unwrap(), None);
    assert_eq!(db.get(&key(1)).unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.stats().tombstones_dropped, 500);
}

#[test]
fn last_level_policy_keeps_tombstones_above_the_bottom() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path(), manual_options().with_max_levels(4).with_l0_compaction_trigger(2)).unwrap();
    for i in 0..100 {
        db.put(&key(i), b"v").unwrap();
    }
    db.flush().unwrap();
    for i in 0..50 {
        db.delete(&key(i)).unwrap();
    }
    db.flush().unwrap();

    let outcomes = db.compact().unwrap();
    assert_eq!(outcomes[0].target_level, 1);
    assert_eq!(outcomes[0].tombstones_dropped, 0);
    let kept: u64 = outcomes[0].outputs.iter().map(|m| m.tombstone_count).sum();
    assert_eq!(kept, 50);
    assert_eq!(db.get(&key(10)).unwrap(), None);
}

#[test]
fn grace_policy_waits_for_retention_window() {
    for (retain, expect_dropped) in [(0u64, 50u64), (1_000_000, 0)] {
        let dir = tempdir().unwrap();
        let db = DB::open(
            dir.path(),
            manual_options()
                .with_max_levels(4)
                .with_l0_compaction_trigger(2)
                .with_tombstone_policy(TombstonePolicy::Grace { retain_sequences: retain }),
        )
        .unwrap();
        for i in 0..100 {
            db.put(&key(i), b"v").unwrap();
        }
        db.flush().unwrap();
        for i in 0..50 {
            db.delete(&key(i)).unwrap();
        }
        db.flush().unwrap();

        let outcomes = db.compact().unwrap();
        assert_eq!(outcomes[0].tombstones_dropped, expect_dropped, "retain {}", retain);
        assert_eq!(db.get(&key(10)).unwrap(), None);
        assert_eq!(db.get(&key(60)).unwrap(), Some(b"v".to_vec()));
    }
}

#[test]
fn grace_policy_keeps_tombstone_that_shadows_deeper_data() {
    let dir = tempdir().unwrap();
    let db = DB::open(
        dir.path(),
        manual_options()
            .with_max_levels(4)
            .with_l0_compaction_trigger(2)
            .with_tombstone_policy(TombstonePolicy::Grace { retain_sequences: 0 }),
    )
    .unwrap();

    // Old value pushed down to L1.
    db.put(b"key00001", b"old").unwrap();
    db.put(b"key00009", b"old").unwrap();
    db.flush().unwrap();
    db.put(b"key00002", b"x").unwrap();
    db.flush().unwrap();
    db.compact().unwrap();

    // Move it one more level: L1 over budget.
    let dir2 = dir.path().to_path_buf();
    db.close().unwrap();
    drop(db);
    let db = DB::open(
        &dir2,
        manual_options()
            .with_max_levels(4)
            .with_l0_compaction_trigger(2)
            .with_level1_max_bytes(1)
            .with_level_fanout(100_000)
            .with_tombstone_policy(TombstonePolicy::Grace { retain_sequences: 0 }),
    )
    .unwrap();
    db.compact().unwrap();
    assert_eq!(db.stats().levels[2].segments, 1);

    // Delete lands in L1 above the L2 value and must survive there.
    db.delete(b"key00001").unwrap();
    db.flush().unwrap();
    db.put(b"key00003", b"y").unwrap();
    db.flush().unwrap();
    db.compact().unwrap();

    assert_eq!(db.get(b"key00001").unwrap(), None, "deleted key must not resurrect");
    assert_eq!(db.get(b"key00009").unwrap(), Some(b"old".to_vec()));
}

#[test]
fn cold_segment_moves_down_hot_segment_stays() {
    let dir = tempdir().unwrap();
    // Every recorded read starts a new decay epoch.
    let db = DB::open(
        dir.path(),
        manual_options()
            .with_max_levels(4)
            .with_l0_compaction_trigger(2)
            .with_tiering(1_000, 1),
    )
    .unwrap();
    for i in 0..100 {
        db.put(&key(i), b"v").unwrap();
    }
    db.flush().unwrap();
    db.put(&key(200), b"v").unwrap();
    db.flush().unwrap();

    let outcomes = db.compact().unwrap();
    assert_eq!(outcomes.len(), 1, "fresh L1 segment is too new to judge");
    assert_eq!(db.stats().levels[1].segments, 1);

    // One read halves the counter below 1 in a new epoch: cold.
    assert_eq!(db.get(&key(5)).unwrap(), Some(b"v".to_vec()));
    let outcomes = db.compact().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].reason, CompactionReason::Placement(_)));
    assert_eq!((outcomes[0].source_level, outcomes[0].target_level), (1, 2));

    let stats = db.stats();
    assert_eq!(stats.levels[1].segments, 0);
    assert_eq!(stats.levels[2].segments, 1);
    assert_eq!(db.get(&key(200)).unwrap(), Some(b"v".to_vec()));
}

#[test]
fn hot_segment_is_not_demoted() {
    let dir = tempdir().unwrap();
    let db = DB::open(
        dir.path(),
        manual_options()
            .with_max_levels(4)
            .with_l0_compaction_trigger(2)
            .with_tiering(2, 1_000_000),
    )
    .unwrap();
    for i in 0..100 {
        db.put(&key(i), b"v").unwrap();
    }
    db.flush().unwrap();
    db.put(&key(200), b"v").unwrap();
    db.flush().unwrap();
    db.compact().unwrap();

    for i in 0..10 {
        db.get(&key(i)).unwrap();
    }
    assert!(db.compact().unwrap().is_empty());
    assert_eq!(db.stats().levels[1].segments, 1);
}
