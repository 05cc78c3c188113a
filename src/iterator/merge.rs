use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;

use crate::error::Result;
use crate::iterator::{BoxedIterator, StorageIterator};
use crate::types::{SequenceNumber, ValueType, compare_internal};

/// One source inside the merge heap.
struct HeapEntry {
    /// Position in the caller's source list; lower = newer source.
    index: usize,
    iter: BoxedIterator,
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; reverse so the smallest
    // (key ASC, sequence DESC, source ASC) sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        compare_internal(
            self.iter.key(),
            self.iter.sequence(),
            other.iter.key(),
            other.iter.sequence(),
        )
        .then_with(|| self.index.cmp(&other.index))
        .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merges multiple sorted iterators into a single sorted stream.
///
/// Used for:
/// - Range scans across memtables + all segment levels
/// - Compaction (k-way merge of input segments)
/// - Flush (collapsing memtable versions)
///
/// Ordering guarantee: entries are yielded in user-key order.
/// Deduplication: only the newest version of each user key is yielded — the
/// highest sequence wins no matter which source holds it. Tombstones ARE
/// yielded; scans skip them, compaction decides whether to keep them.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    current: Option<HeapEntry>,
    /// Sources that ran dry; kept so `seek` can revive them.
    exhausted: Vec<HeapEntry>,
}

impl MergeIterator {
    /// Create a new MergeIterator from multiple sorted sources.
    /// Sources are ordered by priority: index 0 = newest (memtable),
    /// higher indices = older (deeper levels). Priority only matters if two
    /// sources carry the same sequence for a key.
    pub fn new(iters: Vec<BoxedIterator>) -> Self {
        let mut merge = MergeIterator {
            heap: BinaryHeap::new(),
            current: None,
            exhausted: Vec::new(),
        };
        for (index, iter) in iters.into_iter().enumerate() {
            merge.admit(HeapEntry { index, iter });
        }
        merge.current = merge.heap.pop();
        merge
    }

    fn admit(&mut self, entry: HeapEntry) {
        if entry.iter.is_valid() {
            self.heap.push(entry);
        } else {
            self.exhausted.push(entry);
        }
    }

    fn current(&self) -> &HeapEntry {
        self.current
            .as_ref()
            .expect("merge iterator used while invalid")
    }
}

impl StorageIterator for MergeIterator {
    fn key(&self) -> &[u8] {
        self.current().iter.key()
    }

    fn value(&self) -> &[u8] {
        self.current().iter.value()
    }

    fn sequence(&self) -> SequenceNumber {
        self.current().iter.sequence()
    }

    fn value_type(&self) -> ValueType {
        self.current().iter.value_type()
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> Result<()> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };
        let key = current.iter.key().to_vec();

        // Older versions of this key inside the winning source.
        loop {
            current.iter.next()?;
            if !current.iter.is_valid() || current.iter.key() != key.as_slice() {
                break;
            }
        }

        // Older versions of this key in every other source.
        while let Some(mut top) = self.heap.peek_mut() {
            if top.iter.key() != key.as_slice() {
                break;
            }
            if let Err(e) = top.iter.next() {
                PeekMut::pop(top);
                return Err(e);
            }
            if !top.iter.is_valid() {
                let dry = PeekMut::pop(top);
                self.exhausted.push(dry);
            }
        }

        self.admit(current);
        self.current = self.heap.pop();
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let mut sources: Vec<HeapEntry> = self.exhausted.drain(..).collect();
        sources.extend(self.heap.drain());
        sources.extend(self.current.take());

        for source in sources.iter_mut() {
            source.iter.seek(key)?;
        }
        for source in sources {
            self.admit(source);
        }
        self.current = self.heap.pop();
        Ok(())
    }
}
