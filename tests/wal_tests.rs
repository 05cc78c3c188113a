// Write-ahead log: record framing, single-file writer and reader, and the
// manager that numbers, rotates, purges and replays log files.

use std::io::Write;
use std::path::{Path, PathBuf};

use tierkv::wal::{LogFile, RecordType, SyncPolicy, WALManager, WALReader, WALRecord, WALWriter};

fn make_record(i: usize) -> WALRecord {
    WALRecord::put(format!("key{}", i).into_bytes(), format!("val{}", i).into_bytes())
}

/// A single log file holding puts key0.. with sequences 1..
fn log_with(dir: &Path, count: usize, policy: SyncPolicy) -> PathBuf {
    let path = dir.join("000001.log");
    let mut writer = WALWriter::new(&path, policy).unwrap();
    for i in 0..count {
        writer.append(&make_record(i).with_sequence(i as u64 + 1)).unwrap();
    }
    writer.sync().unwrap();
    path
}

fn read_all(path: &Path) -> Vec<WALRecord> {
    WALReader::new(path).unwrap().iter().map(|r| r.unwrap()).collect()
}

fn log_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .count()
}

// =============================================================================
// Record framing
// =============================================================================
#[test]
fn records_keep_kind_sequence_and_payload() {
    let cases = [
        (WALRecord::put(b"user:1".to_vec(), b"alice".to_vec()).with_sequence(42), RecordType::Put),
        (WALRecord::put(b"user:2".to_vec(), Vec::new()).with_sequence(43), RecordType::Put),
        (WALRecord::delete(b"user:1".to_vec()).with_sequence(44), RecordType::Delete),
        (WALRecord::put(vec![0xAB; 10_000], vec![0xCD; 100_000]).with_sequence(45), RecordType::Put),
    ];

    for (record, kind) in cases {
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encoded_size());

        let decoded = WALRecord::decode(&encoded).unwrap();
        assert_eq!(decoded.record_type, kind);
        assert_eq!(decoded.sequence, record.sequence);
        assert_eq!(decoded.key, record.key);
        assert_eq!(decoded.value, record.value);
    }
}

#[test]
fn delete_record_becomes_a_tombstone_entry() {
    let entry = WALRecord::delete(b"gone".to_vec()).with_sequence(9).into_entry();
    assert!(entry.is_tombstone());
    assert_eq!(entry.sequence, 9);

    let entry = WALRecord::put(b"kept".to_vec(), Vec::new()).with_sequence(10).into_entry();
    assert!(!entry.is_tombstone(), "an empty value is still a value");
}

#[test]
fn damaged_record_rejected() {
    let encoded = make_record(0).encode();

    for cut in [0, 3, encoded.len() / 2, encoded.len() - 1] {
        assert!(WALRecord::decode(&encoded[..cut]).is_err(), "cut at {}", cut);
    }

    for pos in [0, 5, encoded.len() - 1] {
        let mut flipped = encoded.clone();
        flipped[pos] ^= 0x40;
        assert!(WALRecord::decode(&flipped).unwrap_err().is_corruption(), "flip at {}", pos);
    }
}

// =============================================================================
// Writer
// =============================================================================
#[test]
fn writer_offset_matches_file_length() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("000001.log");
    let mut writer = WALWriter::new(&path, SyncPolicy::Manual).unwrap();

    let mut expected = 0u64;
    for i in [1usize, 10, 100, 1000] {
        let record = make_record(i);
        expected += record.encoded_size() as u64;
        writer.append(&record).unwrap();
        assert_eq!(writer.offset(), expected);
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
}

#[test]
fn reopened_writer_appends_after_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 3, SyncPolicy::EveryWrite);

    let mut writer = WALWriter::new(&path, SyncPolicy::EveryWrite).unwrap();
    assert_eq!(writer.offset(), std::fs::metadata(&path).unwrap().len());
    writer.append(&make_record(3).with_sequence(4)).unwrap();

    let sequences: Vec<u64> = read_all(&path).iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[test]
fn sync_policy_decides_when_appends_fsync() {
    let dir = tempfile::tempdir().unwrap();
    let pending_after_each = |policy: SyncPolicy, name: &str| -> Vec<usize> {
        let mut writer = WALWriter::new(&dir.path().join(name), policy).unwrap();
        (0..5)
            .map(|i| {
                writer.append(&make_record(i)).unwrap();
                writer.writes_since_sync()
            })
            .collect()
    };

    assert_eq!(pending_after_each(SyncPolicy::EveryWrite, "a.log"), vec![0, 0, 0, 0, 0]);
    assert_eq!(pending_after_each(SyncPolicy::EveryNWrites(3), "b.log"), vec![1, 2, 0, 1, 2]);
    assert_eq!(pending_after_each(SyncPolicy::Manual, "c.log"), vec![1, 2, 3, 4, 5]);

    let mut writer = WALWriter::new(&dir.path().join("c.log"), SyncPolicy::Manual).unwrap();
    writer.append(&make_record(9)).unwrap();
    writer.sync().unwrap();
    assert_eq!(writer.writes_since_sync(), 0);
}

/// In-memory log file that can be told to fail its next write or sync
/// after letting part of the write through.
#[derive(Default)]
struct FlakyFile {
    data: Vec<u8>,
    fail_write: bool,
    fail_sync: bool,
}

impl Write for FlakyFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.fail_write {
            self.fail_write = false;
            self.data.extend_from_slice(&buf[..buf.len() / 2]);
            return Err(std::io::Error::other("write failed"));
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogFile for FlakyFile {
    fn sync(&mut self) -> std::io::Result<()> {
        if self.fail_sync {
            self.fail_sync = false;
            return Err(std::io::Error::other("sync failed"));
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.data.truncate(len as usize);
        Ok(())
    }
}

fn records_in(data: &[u8]) -> Vec<WALRecord> {
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let record = WALRecord::decode(rest).unwrap();
        rest = &rest[record.encoded_size()..];
        records.push(record);
    }
    records
}

#[test]
fn failed_append_leaves_nothing_behind() {
    let mut writer = WALWriter::from_file(FlakyFile::default(), 0, SyncPolicy::EveryWrite);
    writer.append(&make_record(0).with_sequence(1)).unwrap();

    writer.get_mut().fail_write = true;
    assert!(writer.append(&make_record(1).with_sequence(2)).is_err());

    writer.get_mut().fail_sync = true;
    assert!(writer.append(&make_record(2).with_sequence(2)).is_err());

    writer.append(&make_record(3).with_sequence(2)).unwrap();
    writer.sync().unwrap();

    let records = records_in(&writer.get_ref().data);
    let keys: Vec<Vec<u8>> = records.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, vec![b"key0".to_vec(), b"key3".to_vec()]);
    assert_eq!(writer.offset(), writer.get_ref().data.len() as u64);
}

#[test]
fn every_policy_leaves_a_readable_log() {
    for policy in [SyncPolicy::EveryWrite, SyncPolicy::EveryNWrites(2), SyncPolicy::Manual] {
        let dir = tempfile::tempdir().unwrap();
        let records = read_all(&log_with(dir.path(), 5, policy));
        let keys: Vec<Vec<u8>> = records.into_iter().map(|r| r.key).collect();
        let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("key{}", i).into_bytes()).collect();
        assert_eq!(keys, expected, "{:?}", policy);
    }
}

// =============================================================================
// Reader
// =============================================================================
#[test]
fn torn_final_record_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 5, SyncPolicy::EveryWrite);

    let len = std::fs::metadata(&path).unwrap().len();
    std::fs::OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

    let reader = WALReader::new(&path).unwrap();
    let mut iter = reader.iter();
    let sequences: Vec<u64> = iter.by_ref().map(|r| r.unwrap().sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert!(iter.stopped_early());
}

#[test]
fn intact_log_is_read_to_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 5, SyncPolicy::EveryWrite);

    let reader = WALReader::new(&path).unwrap();
    let mut iter = reader.iter();
    assert_eq!(iter.by_ref().count(), 5);
    assert!(!iter.stopped_early());
}

#[test]
fn damaged_final_record_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 5, SyncPolicy::EveryWrite);

    let mut raw = std::fs::read(&path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    let sequences: Vec<u64> = read_all(&path).iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[test]
fn damage_in_front_of_intact_records_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 5, SyncPolicy::EveryWrite);

    // Records are equal-sized here; damage a value byte of the third one.
    let record_len = make_record(0).encoded_size();
    let mut raw = std::fs::read(&path).unwrap();
    raw[3 * record_len - 1] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    let reader = WALReader::new(&path).unwrap();
    let results: Vec<_> = reader.iter().collect();
    assert_eq!(results.len(), 3);
    assert!(results[..2].iter().all(|r| r.is_ok()));
    assert!(results[2].as_ref().unwrap_err().is_corruption());
}

#[test]
fn damaged_length_field_is_still_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_with(dir.path(), 5, SyncPolicy::EveryWrite);

    // A huge length makes the second record look like it runs past the end.
    let record_len = make_record(0).encoded_size();
    let mut raw = std::fs::read(&path).unwrap();
    raw[record_len + 7] = 0x7F;
    std::fs::write(&path, &raw).unwrap();

    let results: Vec<_> = WALReader::new(&path).unwrap().iter().collect();
    assert_eq!(results.len(), 2);
    assert!(results[1].as_ref().unwrap_err().is_corruption());
}

#[test]
fn garbage_only_file_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("000001.log");
    std::fs::write(&path, [0xDE, 0xAD, 0x00]).unwrap();

    assert_eq!(WALReader::new(&path).unwrap().iter().count(), 0);
}

// =============================================================================
// Manager: sequences, rotation, purge, replay
// =============================================================================
#[test]
fn manager_assigns_increasing_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();

    let a = manager.append(make_record(0)).unwrap();
    let b = manager.append(make_record(1)).unwrap();
    let c = manager.append(WALRecord::delete(b"key0".to_vec())).unwrap();
    assert_eq!((a, b, c), (1, 2, 3));
    assert_eq!(manager.next_sequence(), 4);
}

#[test]
fn writes_go_to_new_wal_after_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();
    assert_eq!(log_files(dir.path()), 1);

    manager.append(WALRecord::put(b"before".to_vec(), b"rotate".to_vec())).unwrap();
    let old_path = manager.rotate().unwrap();
    manager.append(WALRecord::put(b"after".to_vec(), b"rotate".to_vec())).unwrap();
    manager.flush().unwrap();
    assert_eq!(log_files(dir.path()), 2);

    let old = read_all(&old_path);
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].key, b"before");

    let new = read_all(manager.active_path());
    assert_eq!(new.len(), 1);
    assert_eq!(new[0].key, b"after");
    assert_eq!(new[0].sequence, 2);
}

#[test]
fn size_limit_rotates_automatically() {
    let dir = tempfile::tempdir().unwrap();
    let record_size = make_record(0).encoded_size() as u64;
    let mut manager = WALManager::with_max_file_size(dir.path(), SyncPolicy::Manual, record_size * 3).unwrap();
    let first_id = manager.active_id();

    for i in 0..7 {
        manager.append(make_record(i)).unwrap();
    }
    // 3 + 3 records filled two files; the 7th sits in a third.
    assert_eq!(manager.active_id(), first_id + 2);
    assert_eq!(log_files(dir.path()), 3);
}

#[test]
fn purge_before_removes_only_older_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();

    let old1 = manager.rotate().unwrap();
    let old2 = manager.rotate().unwrap();
    let old3 = manager.rotate().unwrap();
    assert_eq!(log_files(dir.path()), 4);

    let floor = manager.active_id() - 1;
    assert_eq!(manager.purge_before(floor).unwrap(), 2);
    assert!(!old1.exists());
    assert!(!old2.exists());
    assert!(old3.exists());
    assert!(manager.active_path().exists());
}

#[test]
fn replay_reads_every_older_file_in_order() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();
        for i in 0..3 {
            manager.append(make_record(i)).unwrap();
        }
        manager.rotate().unwrap();
        for i in 3..6 {
            manager.append(make_record(i)).unwrap();
        }
    }

    // A fresh manager writes to a new file and replays the two old ones.
    let manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();
    let mut replay = manager.replay().unwrap();
    let sequences: Vec<u64> = replay.by_ref().map(|r| r.unwrap().sequence).collect();

    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(replay.files_read(), 2);
    assert_eq!(replay.torn_tails(), 0);
}

#[test]
fn replay_skips_torn_tail_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let first_path = {
        let mut manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();
        manager.append(make_record(0)).unwrap();
        manager.append(make_record(1)).unwrap();
        let first = manager.rotate().unwrap();
        manager.append(make_record(2)).unwrap();
        first
    };

    let mut file = std::fs::OpenOptions::new().append(true).open(&first_path).unwrap();
    file.write_all(&[0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();

    let manager = WALManager::new(dir.path(), SyncPolicy::EveryWrite).unwrap();
    let mut replay = manager.replay().unwrap();
    let keys: Vec<Vec<u8>> = replay.by_ref().map(|r| r.unwrap().key).collect();

    assert_eq!(keys, vec![b"key0".to_vec(), b"key1".to_vec(), b"key2".to_vec()]);
    assert_eq!(replay.torn_tails(), 1);
}
