use bytes::BufMut;

use crate::db::options::ReadOptions;
use crate::error::{Error, Result};
use crate::iterator::{MergeIterator, StorageIterator};
use crate::segment::footer::{take_bytes, take_u8};
use crate::types::{Key, Value};

const CURSOR_VERSION: u8 = 1;

/// Where an interrupted scan picks up again: the half-open range
/// `[next_key, end)` that has not been returned yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub next_key: Vec<u8>,
    pub end: Vec<u8>,
}

impl ScanCursor {
    /// `[version u8][start_len u32][start][end_len u32][end][crc32 u32]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + self.next_key.len() + 4 + self.end.len() + 4);
        buf.put_u8(CURSOR_VERSION);
        buf.put_u32_le(self.next_key.len() as u32);
        buf.extend_from_slice(&self.next_key);
        buf.put_u32_le(self.end.len() as u32);
        buf.extend_from_slice(&self.end);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let malformed = |what: &str| Error::InvalidArgument(format!("malformed scan cursor: {what}"));

        if data.len() < 4 {
            return Err(malformed("too short"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(body) != stored {
            return Err(malformed("checksum mismatch"));
        }

        let mut buf = body;
        let version = take_u8(&mut buf, "cursor version").map_err(|_| malformed("version"))?;
        if version != CURSOR_VERSION {
            return Err(malformed("unknown version"));
        }
        let next_key = take_bytes(&mut buf, "cursor start").map_err(|_| malformed("start key"))?;
        let end = take_bytes(&mut buf, "cursor end").map_err(|_| malformed("end key"))?;
        if !buf.is_empty() {
            return Err(malformed("trailing bytes"));
        }
        Ok(ScanCursor { next_key, end })
    }
}

/// Lazy range scan over `[start, end)`.
///
/// Pulls from a merge of every memtable and segment that overlaps the range,
/// one entry at a time. Deleted keys are skipped. A deadline or I/O error
/// is yielded once, after which the iterator is fused; `cursor()` then tells
/// the caller where to resume.
pub struct ScanIter {
    merged: MergeIterator,
    end: Vec<u8>,
    options: ReadOptions,
    next_key: Vec<u8>,
    exhausted: bool,
    failed: bool,
}

impl ScanIter {
    pub(crate) fn new(merged: MergeIterator, start: &[u8], end: &[u8], options: ReadOptions) -> Self {
        ScanIter {
            merged,
            end: end.to_vec(),
            options,
            next_key: start.to_vec(),
            exhausted: false,
            failed: false,
        }
    }

    /// Resume point, or `None` once the range is fully consumed.
    pub fn cursor(&self) -> Option<ScanCursor> {
        if self.exhausted {
            return None;
        }
        Some(ScanCursor {
            next_key: self.next_key.clone(),
            end: self.end.clone(),
        })
    }

    fn advance(&mut self) -> Result<Option<(Key, Value)>> {
        loop {
            self.options.check()?;
            if !self.merged.is_valid() || self.merged.key() >= self.end.as_slice() {
                self.exhausted = true;
                return Ok(None);
            }

            let item = (!self.merged.is_tombstone())
                .then(|| (self.merged.key().to_vec(), self.merged.value().to_vec()));
            self.merged.next()?;

            if let Some((key, value)) = item {
                self.next_key = successor(&key);
                return Ok(Some((key, value)));
            }
        }
    }
}

impl Iterator for ScanIter {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.failed {
            return None;
        }
        match self.advance() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Smallest key strictly greater than `key`.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Exclusive upper bound of all keys starting with `prefix`: the prefix with
/// its last non-0xFF byte bumped. A prefix of only 0xFF bytes (or none) has
/// no such bound, so it gets one longer than any key can be.
pub(crate) fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    match prefix.iter().rposition(|b| *b != 0xFF) {
        Some(last) => {
            let mut end = prefix[..=last].to_vec();
            end[last] += 1;
            end
        }
        None => vec![0xFF; u16::MAX as usize + 1],
    }
}
