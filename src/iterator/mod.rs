pub mod merge;

pub use merge::MergeIterator;

use crate::error::Result;
use crate::types::{Entry, SequenceNumber, ValueType};

/// The central iteration abstraction for the storage engine.
///
/// Every sorted data source (memtable, block, segment, merged view)
/// implements this trait. This enables composability — MergeIterator
/// takes Vec<Box<dyn StorageIterator>> and merges them.
///
/// Sources yield entries in internal-key order: user key ascending, and for
/// one key, sequence descending.
pub trait StorageIterator: Send {
    /// Returns the current key. Only valid when is_valid() is true.
    fn key(&self) -> &[u8];

    /// Returns the current value. Only valid when is_valid() is true.
    fn value(&self) -> &[u8];

    /// Sequence number of the current entry.
    fn sequence(&self) -> SequenceNumber;

    /// Put or tombstone.
    fn value_type(&self) -> ValueType;

    /// Returns true if the iterator is positioned at a valid entry.
    fn is_valid(&self) -> bool;

    /// Advances to the next entry. Returns error on IO failure.
    fn next(&mut self) -> Result<()>;

    /// Positions the iterator at the first entry with key >= target.
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    fn is_tombstone(&self) -> bool {
        self.value_type() == ValueType::Delete
    }

    /// Copy the current entry out.
    fn to_entry(&self) -> Entry {
        Entry {
            key: self.key().to_vec(),
            value: self.value().to_vec(),
            sequence: self.sequence(),
            value_type: self.value_type(),
        }
    }
}

pub type BoxedIterator = Box<dyn StorageIterator>;

/// A sorted, already materialized run of entries.
pub struct VecIterator {
    entries: Vec<Entry>,
    position: usize,
}

impl VecIterator {
    /// `entries` must already be in internal-key order.
    pub fn new(entries: Vec<Entry>) -> Self {
        VecIterator {
            entries,
            position: 0,
        }
    }

    fn current(&self) -> &Entry {
        &self.entries[self.position]
    }
}

impl StorageIterator for VecIterator {
    fn key(&self) -> &[u8] {
        &self.current().key
    }

    fn value(&self) -> &[u8] {
        &self.current().value
    }

    fn sequence(&self) -> SequenceNumber {
        self.current().sequence
    }

    fn value_type(&self) -> ValueType {
        self.current().value_type
    }

    fn is_valid(&self) -> bool {
        self.position < self.entries.len()
    }

    fn next(&mut self) -> Result<()> {
        if self.is_valid() {
            self.position += 1;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.position = self.entries.partition_point(|e| e.key.as_slice() < key);
        Ok(())
    }
}
