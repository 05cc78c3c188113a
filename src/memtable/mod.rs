pub mod skiplist;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::types::{Entry, SequenceNumber, Value, ValueType};
use skiplist::SkipList;

/// In-memory sorted buffer for writes. Wraps a SkipList.
///
/// Every write goes here first. When size exceeds the threshold, the engine
/// freezes the memtable (it is never mutated again) and flushes it to a
/// segment.
///
/// Deletes are tombstones: a version with `ValueType::Delete`. The key can't
/// simply be removed because older versions may exist in segments on disk.
///
/// The list sits behind an `RwLock` so frozen tables can be shared as
/// `Arc<MemTable>` between readers; the engine's write path guarantees a
/// single mutator at a time.
pub struct MemTable {
    id: u64,
    data: RwLock<SkipList>,
    size_limit: usize,
    approximate_size: AtomicUsize,
    max_sequence: AtomicU64,
}

impl MemTable {
    /// Create a new empty memtable with given size limit.
    pub fn new(id: u64, size_limit: usize) -> Self {
        MemTable {
            id,
            data: RwLock::new(SkipList::new()),
            size_limit,
            approximate_size: AtomicUsize::new(0),
            max_sequence: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert or update a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8], sequence: SequenceNumber) {
        self.insert(key, sequence, ValueType::Put, value);
    }

    /// Mark a key as deleted by writing a tombstone.
    pub fn delete(&self, key: &[u8], sequence: SequenceNumber) {
        self.insert(key, sequence, ValueType::Delete, &[]);
    }

    fn insert(&self, key: &[u8], sequence: SequenceNumber, value_type: ValueType, value: &[u8]) {
        let mut data = self.data.write();
        data.insert(key, sequence, value_type, value);
        self.approximate_size.store(data.size_bytes(), Ordering::Release);
        self.max_sequence.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Newest version of `key` visible at `read_sequence`, tombstones included.
    pub fn lookup(&self, key: &[u8], read_sequence: SequenceNumber) -> Option<Entry> {
        let data = self.data.read();
        data.get(key, read_sequence).map(|e| Entry {
            key: e.key.to_vec(),
            value: e.value.to_vec(),
            sequence: e.sequence,
            value_type: e.value_type,
        })
    }

    /// Look up a key. Returns None if not found OR if tombstoned.
    pub fn get(&self, key: &[u8], read_sequence: SequenceNumber) -> Option<Value> {
        self.lookup(key, read_sequence).and_then(Entry::into_value)
    }

    /// Sorted iterator over every version visible at `read_sequence`,
    /// tombstones included.
    pub fn iter(self: &Arc<Self>, read_sequence: SequenceNumber) -> MemTableIterator {
        let first = self.data.read().first();
        MemTableIterator::new(Arc::clone(self), read_sequence, first)
    }

    /// Number of stored versions.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current memory usage in bytes.
    pub fn size(&self) -> usize {
        self.approximate_size.load(Ordering::Acquire)
    }

    /// Check if memtable has reached the flush threshold.
    pub fn is_full(&self) -> bool {
        self.size() >= self.size_limit
    }

    /// Highest sequence number written into this table (0 if empty).
    pub fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::Acquire)
    }
}

/// Cursor over a shared memtable.
///
/// Holds the table by `Arc` and remembers its position as an arena index,
/// which stays valid while the table grows. Versions newer than the read
/// sequence are skipped, so concurrent inserts into an active table never
/// become visible mid-iteration.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    read_sequence: SequenceNumber,
    position: Option<usize>,
    current: Option<Entry>,
}

impl MemTableIterator {
    fn new(table: Arc<MemTable>, read_sequence: SequenceNumber, start: Option<usize>) -> Self {
        let mut iter = MemTableIterator {
            table,
            read_sequence,
            position: start,
            current: None,
        };
        iter.settle();
        iter
    }

    /// Advance `position` past invisible versions and cache the entry.
    fn settle(&mut self) {
        let data = self.table.data.read();
        while let Some(index) = self.position {
            let entry = data.entry(index);
            if entry.sequence <= self.read_sequence {
                self.current = Some(Entry {
                    key: entry.key.to_vec(),
                    value: entry.value.to_vec(),
                    sequence: entry.sequence,
                    value_type: entry.value_type,
                });
                return;
            }
            self.position = data.next_of(index);
        }
        self.current = None;
    }

    fn entry(&self) -> &Entry {
        self.current
            .as_ref()
            .expect("memtable iterator used while invalid")
    }
}

impl StorageIterator for MemTableIterator {
    fn key(&self) -> &[u8] {
        &self.entry().key
    }

    fn value(&self) -> &[u8] {
        &self.entry().value
    }

    fn sequence(&self) -> SequenceNumber {
        self.entry().sequence
    }

    fn value_type(&self) -> ValueType {
        self.entry().value_type
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(index) = self.position {
            self.position = self.table.data.read().next_of(index);
            self.settle();
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.position = self.table.data.read().seek(key, SequenceNumber::MAX);
        self.settle();
        Ok(())
    }
}
