use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::wal::record::WALRecord;
use crate::wal::wal_path;

/// Reads WAL records from a file for crash recovery.
///
/// Loads the entire file into memory, then iterates record by record.
pub struct WALReader {
    data: Vec<u8>,
}

impl WALReader {
    /// Open a WAL file for reading.
    pub fn new(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(WALReader { data })
    }

    /// Create an iterator over all valid records in the WAL.
    pub fn iter(&self) -> WALIterator<'_> {
        WALIterator {
            data: &self.data,
            offset: 0,
            done: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over WAL records.
///
/// A record that fails to decode ends the file. If nothing intact follows
/// it, it is the torn tail of an append that never completed and iteration
/// simply stops. If an intact record follows it, acknowledged writes sit
/// behind damaged bytes and the iterator yields `Error::Corruption` instead.
pub struct WALIterator<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl WALIterator<'_> {
    /// Bytes consumed by valid records so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether iteration stopped before the end of the file.
    pub fn stopped_early(&self) -> bool {
        self.offset < self.data.len()
    }
}

impl Iterator for WALIterator<'_> {
    type Item = Result<WALRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        match WALRecord::decode(&self.data[self.offset..]) {
            Ok(record) => {
                self.offset += record.encoded_size();
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                let intact_after = (self.offset + 1..self.data.len())
                    .find(|start| WALRecord::decode(&self.data[*start..]).is_ok());
                intact_after.map(|next| {
                    Err(Error::corruption(format!(
                        "damaged WAL record at offset {} ({e}) is followed by an intact record at offset {next}",
                        self.offset
                    )))
                })
            }
        }
    }
}

/// Records from several WAL files, oldest file first. Files are loaded one
/// at a time; a torn tail ends its file and replay moves to the next one,
/// while damage in front of intact records fails the replay.
pub struct WalReplay {
    dir: PathBuf,
    pending: VecDeque<u64>,
    buffered: VecDeque<WALRecord>,
    files_read: usize,
    torn_tails: usize,
}

impl WalReplay {
    pub(crate) fn new(dir: PathBuf, ids: Vec<u64>) -> Self {
        WalReplay {
            dir,
            pending: ids.into(),
            buffered: VecDeque::new(),
            files_read: 0,
            torn_tails: 0,
        }
    }

    pub fn files_read(&self) -> usize {
        self.files_read
    }

    /// Number of files whose trailing bytes were discarded.
    pub fn torn_tails(&self) -> usize {
        self.torn_tails
    }

    fn load_next_file(&mut self) -> Result<bool> {
        let Some(id) = self.pending.pop_front() else {
            return Ok(false);
        };
        let reader = WALReader::new(&wal_path(&self.dir, id))?;
        let mut iter = reader.iter();
        for record in iter.by_ref() {
            self.buffered.push_back(record?);
        }
        if iter.stopped_early() {
            self.torn_tails += 1;
            tracing::warn!(
                wal_id = id,
                discarded_bytes = reader.len() - iter.offset(),
                "discarding torn WAL tail"
            );
        }
        self.files_read += 1;
        Ok(true)
    }
}

impl Iterator for WalReplay {
    type Item = Result<WALRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(Ok(record));
            }
            match self.load_next_file() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
