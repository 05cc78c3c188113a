use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::SequenceNumber;
use crate::wal::record::WALRecord;
use crate::wal::{SyncPolicy, WalReplay, list_wal_ids, wal_path};

/// The file a WAL writer appends to.
pub trait LogFile: Write {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;
    /// Cut the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Appends WAL records to one file.
///
/// Each record goes to the file in a single `write_all`, so nothing is left
/// buffered in the process once `append` returns. A failed append is cut
/// back out of the file: the caller saw an error, so replay must not
/// resurrect the record.
pub struct WALWriter<F: LogFile = File> {
    file: F,
    offset: u64,
    sync_policy: SyncPolicy,
    writes_since_sync: usize,
}

impl WALWriter<File> {
    /// Open (or create) a WAL file at `path`, appending after its contents.
    pub fn new(path: &Path, sync_policy: SyncPolicy) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = file.metadata()?.len();
        Ok(WALWriter::from_file(file, offset, sync_policy))
    }
}

impl<F: LogFile> WALWriter<F> {
    /// Wrap an open file whose first `offset` bytes are intact records.
    pub fn from_file(file: F, offset: u64, sync_policy: SyncPolicy) -> Self {
        WALWriter {
            file,
            offset,
            sync_policy,
            writes_since_sync: 0,
        }
    }

    /// Append a record. Depending on the sync policy this also fsyncs.
    pub fn append(&mut self, record: &WALRecord) -> Result<()> {
        let encoded = record.encode();
        let pending = self.writes_since_sync + 1;
        let must_sync = match self.sync_policy {
            SyncPolicy::EveryWrite => true,
            SyncPolicy::EveryNWrites(n) => pending >= n,
            SyncPolicy::Manual => false,
        };

        let written = self
            .file
            .write_all(&encoded)
            .and_then(|()| if must_sync { self.file.sync() } else { Ok(()) });
        if let Err(e) = written {
            if let Err(undo) = self.file.truncate(self.offset) {
                tracing::error!(offset = self.offset, error = %undo, "failed to cut a failed record out of the WAL");
            }
            return Err(e.into());
        }

        self.offset += encoded.len() as u64;
        self.writes_since_sync = if must_sync { 0 } else { pending };
        Ok(())
    }

    /// fsync everything appended so far.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Bytes of intact records in the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends since the last fsync.
    pub fn writes_since_sync(&self) -> usize {
        self.writes_since_sync
    }

    pub fn get_ref(&self) -> &F {
        &self.file
    }

    pub fn get_mut(&mut self) -> &mut F {
        &mut self.file
    }
}

/// Owns the WAL directory: the active writer, sequence assignment, rotation
/// and deletion of files whose contents are durable in a segment.
///
/// CRITICAL INVARIANT: a WAL file is only deleted AFTER every record in it
/// is part of an installed, fsync'd segment. Violating this loses data.
pub struct WALManager {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    max_file_size: u64,
    active_id: u64,
    active_path: PathBuf,
    active: WALWriter,
    next_sequence: SequenceNumber,
    /// Set when an append or a size rotation failed; the next append starts
    /// a fresh file so leftovers of the failure can only ever be a tail.
    poisoned: bool,
}

impl WALManager {
    /// Open the WAL directory. Existing files are left untouched for replay;
    /// new records go to a fresh file numbered after the newest one.
    pub fn new(dir: &Path, sync_policy: SyncPolicy) -> Result<Self> {
        Self::with_max_file_size(dir, sync_policy, u64::MAX)
    }

    pub fn with_max_file_size(dir: &Path, sync_policy: SyncPolicy, max_file_size: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let active_id = list_wal_ids(dir)?.last().map_or(1, |id| id + 1);
        let active_path = wal_path(dir, active_id);
        let active = WALWriter::new(&active_path, sync_policy)?;

        Ok(WALManager {
            dir: dir.to_path_buf(),
            sync_policy,
            max_file_size,
            active_id,
            active_path,
            active,
            next_sequence: 1,
            poisoned: false,
        })
    }

    /// Replay every WAL file older than the active one, in append order.
    pub fn replay(&self) -> Result<WalReplay> {
        let ids = list_wal_ids(&self.dir)?
            .into_iter()
            .filter(|id| *id < self.active_id)
            .collect();
        Ok(WalReplay::new(self.dir.clone(), ids))
    }

    /// Assign the next sequence number to `record` and append it.
    /// The sequence is only consumed when the write succeeds.
    pub fn append(&mut self, record: WALRecord) -> Result<SequenceNumber> {
        if self.poisoned {
            self.rotate()?;
            self.poisoned = false;
        }

        let sequence = self.next_sequence;
        let record = record.with_sequence(sequence);
        if let Err(e) = self.active.append(&record) {
            self.poisoned = true;
            return Err(e);
        }
        self.next_sequence += 1;

        if self.active.offset() >= self.max_file_size {
            tracing::debug!(wal_id = self.active_id, size = self.active.offset(), "WAL size limit reached");
            // The record is already durable; a failed rotation is retried
            // by the next append instead of failing this one.
            if let Err(e) = self.rotate() {
                tracing::warn!(wal_id = self.active_id, error = %e, "WAL rotation failed");
                self.poisoned = true;
            }
        }
        Ok(sequence)
    }

    /// Force previously appended records to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.active.sync()
    }

    /// Rotate: seal the current WAL, create a new one.
    /// Returns the path of the old WAL (deleted later via `purge_before`).
    pub fn rotate(&mut self) -> Result<PathBuf> {
        self.active.sync()?;

        let new_id = self.active_id + 1;
        let new_path = wal_path(&self.dir, new_id);
        let writer = WALWriter::new(&new_path, self.sync_policy)?;

        self.active = writer;
        self.active_id = new_id;
        let old_path = std::mem::replace(&mut self.active_path, new_path);
        tracing::debug!(wal_id = new_id, "rotated WAL");
        Ok(old_path)
    }

    /// Delete every WAL file with an id below `id`. Returns how many went.
    pub fn purge_before(&self, id: u64) -> Result<usize> {
        let mut removed = 0;
        for old in list_wal_ids(&self.dir)?.into_iter().filter(|old| *old < id) {
            std::fs::remove_file(wal_path(&self.dir, old))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Continue numbering after recovery.
    pub fn set_next_sequence(&mut self, sequence: SequenceNumber) {
        self.next_sequence = sequence;
    }
}
