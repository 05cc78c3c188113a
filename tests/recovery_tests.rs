// Recovery: clean reopen, crash images taken while the engine is open,
// torn WAL tails, orphan segment cleanup and damaged state.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use tierkv::wal::SyncPolicy;
use tierkv::{DB, Options};

fn manual() -> Options {
    Options::default()
        .with_background_compaction(false)
        .with_wal_sync(SyncPolicy::Manual)
}

/// Copy a directory tree as it is right now, the way a crash would leave it.
fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

fn wal_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(root.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();
    files
}

fn key(i: u32) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

// =============================================================================
// Clean shutdown
// =============================================================================
#[test]
fn reopen_after_close_keeps_everything() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().with_memtable_size_limit(32 << 10)).unwrap();
        for i in 0..3_000 {
            db.put(&key(i), format!("v{}", i).as_bytes()).unwrap();
        }
        db.delete(&key(7)).unwrap();
        db.close().unwrap();
    }

    let db = DB::open(dir.path(), Options::default()).unwrap();
    for i in 0..3_000 {
        let expected = (i != 7).then(|| format!("v{}", i).into_bytes());
        assert_eq!(db.get(&key(i)).unwrap(), expected, "key {}", i);
    }
}

#[test]
fn dropping_the_handle_closes_cleanly() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
    }
    let db = DB::open(dir.path(), manual()).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn sequences_continue_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        db.put(b"k", b"old").unwrap();
        db.flush().unwrap();
    }
    {
        // Memtable empty at open: WAL fully purged, numbering comes from
        // the manifest alone.
        let db = DB::open(dir.path(), manual()).unwrap();
        db.put(b"k", b"new").unwrap();
        db.flush().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    }
    let db = DB::open(dir.path(), manual().with_l0_compaction_trigger(2)).unwrap();
    db.compact().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn flushed_wal_files_are_purged() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path(), manual()).unwrap();
    for round in 0..5 {
        for i in 0..100 {
            db.put(&key(i), format!("{}", round).as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }
    // Only the live, empty log remains.
    assert_eq!(wal_files(dir.path()).len(), 1);
    db.close().unwrap();

    let db = DB::open(dir.path(), manual()).unwrap();
    assert_eq!(db.get(&key(50)).unwrap(), Some(b"4".to_vec()));
}

// =============================================================================
// Crash images
// =============================================================================
#[test]
fn crash_image_with_orphan_recovers_every_key() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = DB::open(
        &db_path,
        manual()
            .with_memtable_size_limit(64 << 10)
            .with_l0_compaction_trigger(2)
            .with_level1_max_bytes(128 << 10)
            .with_target_segment_size(64 << 10),
    )
    .unwrap();

    let mut model = BTreeMap::new();
    for i in 0..10_000u32 {
        let value = format!("value-{}", i).into_bytes();
        db.put(&key(i), &value).unwrap();
        model.insert(key(i), value);
        if i % 7 == 3 {
            let victim = key(i / 2);
            db.delete(&victim).unwrap();
            model.remove(&victim);
        }
        if i % 1_500 == 1_499 {
            db.flush().unwrap();
        }
        if i % 3_000 == 2_999 {
            db.compact().unwrap();
        }
    }
    // Some data only in frozen and active memtables.
    assert!(db.stats().immutable_memtables > 0 || db.stats().memtable_bytes > 0);

    let image = dir.path().join("image");
    copy_tree(&db_path, &image);
    drop(db);

    // A compaction output that never made it into the manifest.
    let orphan = image.join("segments").join("1").join("999999.seg");
    fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    fs::write(&orphan, b"half-written segment").unwrap();

    let db = DB::open(&image, manual()).unwrap();
    assert!(!orphan.exists(), "orphan segment removed at open");
    for (k, v) in &model {
        assert_eq!(db.get(k).unwrap().as_ref(), Some(v), "{:?}", String::from_utf8_lossy(k));
    }
    let scanned: Vec<(Vec<u8>, Vec<u8>)> = db.scan(b"key", b"kez").unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(scanned.len(), model.len());
    assert!(scanned.iter().zip(&model).all(|((k, v), (mk, mv))| k == mk && v == mv));

    // The recovered engine keeps working: new ids never collide.
    db.put(b"after", b"crash").unwrap();
    db.flush().unwrap();
    db.compact().unwrap();
    assert_eq!(db.get(b"after").unwrap(), Some(b"crash".to_vec()));
}

#[test]
fn torn_wal_tail_loses_only_the_last_write() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let db = DB::open(&db_path, manual()).unwrap();
    for i in 0..100 {
        db.put(&key(i), b"v").unwrap();
    }

    let image = dir.path().join("image");
    copy_tree(&db_path, &image);
    drop(db);

    let newest = wal_files(&image).pop().unwrap();
    let len = fs::metadata(&newest).unwrap().len();
    OpenOptions::new().write(true).open(&newest).unwrap().set_len(len - 3).unwrap();

    {
        let db = DB::open(&image, manual()).unwrap();
        assert_eq!(db.get(&key(98)).unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.get(&key(99)).unwrap(), None);
        db.put(&key(99), b"again").unwrap();
    }

    // The torn file is still there; later logs replay past it.
    let db = DB::open(&image, manual()).unwrap();
    assert_eq!(db.get(&key(0)).unwrap(), Some(b"v".to_vec()));
    assert_eq!(db.get(&key(99)).unwrap(), Some(b"again".to_vec()));
}

#[test]
fn garbage_after_last_wal_record_is_ignored() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        db.put(b"a", b"1").unwrap();
        db.close().unwrap();
    }
    let newest = wal_files(dir.path())
        .into_iter()
        .find(|p| fs::metadata(p).unwrap().len() > 0)
        .unwrap();
    let mut data = fs::read(&newest).unwrap();
    data.extend_from_slice(&[0xAB; 11]);
    fs::write(&newest, data).unwrap();

    let db = DB::open(dir.path(), manual()).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
}

fn assert_open_fails_with_corruption(path: &Path) {
    match DB::open(path, manual()) {
        Ok(_) => panic!("open succeeded on a damaged database"),
        Err(e) => assert!(e.is_corruption(), "unexpected error: {e}"),
    }
}

#[test]
fn damaged_wal_record_in_front_of_acknowledged_writes_fails_open() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual().with_wal_sync(SyncPolicy::EveryWrite)).unwrap();
        for i in 0..100 {
            db.put(&key(i), b"value").unwrap();
        }
        db.close().unwrap();
    }

    // Each record is a 21-byte header, an 8-byte key and a 5-byte value.
    let newest = wal_files(dir.path())
        .into_iter()
        .find(|p| fs::metadata(p).unwrap().len() > 0)
        .unwrap();
    let mut data = fs::read(&newest).unwrap();
    assert_eq!(data.len(), 100 * 34);
    data[10 * 34 - 1] ^= 0x01;
    fs::write(&newest, data).unwrap();

    assert_open_fails_with_corruption(dir.path());
}

#[test]
fn damaged_manifest_edit_fails_open_and_keeps_segments() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        for i in 0..3 {
            db.put(&key(i), b"value").unwrap();
            db.flush().unwrap();
        }
        db.close().unwrap();
    }
    let level0 = dir.path().join("segments").join("0");
    assert_eq!(fs::read_dir(&level0).unwrap().count(), 3);

    // Skip the snapshot frame written at open, damage the first flush edit.
    let manifest = dir.path().join("MANIFEST");
    let mut data = fs::read(&manifest).unwrap();
    let snapshot_len = 8 + u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    data[snapshot_len + 10] ^= 0x01;
    fs::write(&manifest, data).unwrap();

    assert_open_fails_with_corruption(dir.path());
    assert_eq!(fs::read_dir(&level0).unwrap().count(), 3, "live segments must not be treated as orphans");
}

#[test]
fn missing_live_segment_fails_open() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        db.put(b"a", b"1").unwrap();
        db.flush().unwrap();
    }
    let level0 = dir.path().join("segments").join("0");
    for entry in fs::read_dir(&level0).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    assert!(DB::open(dir.path(), manual()).is_err());
}

#[test]
fn corrupted_segment_detected_on_read() {
    let dir = tempdir().unwrap();
    {
        let db = DB::open(dir.path(), manual()).unwrap();
        for i in 0..200 {
            db.put(&key(i), b"value").unwrap();
        }
        db.flush().unwrap();
    }
    let segment = fs::read_dir(dir.path().join("segments").join("0"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let mut data = fs::read(&segment).unwrap();
    data[30] ^= 0x55;
    fs::write(&segment, data).unwrap();

    let db = DB::open(dir.path(), manual()).unwrap();
    let err = db.get(&key(0)).unwrap_err();
    assert!(err.is_corruption());
}
