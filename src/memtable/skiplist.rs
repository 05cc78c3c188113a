use std::cmp::Ordering;

use rand::Rng;

use crate::types::{SequenceNumber, ValueType, compare_internal};

/// Maximum height of the skip list. LevelDB uses 12.
pub const MAX_HEIGHT: usize = 12;

/// Probability of promoting a node one level up (LevelDB uses 1/4).
const BRANCHING_P: f64 = 0.25;

/// Index of the head sentinel in the arena.
const HEAD: usize = 0;

/// Per-node bookkeeping charged against the size estimate, on top of key and
/// value bytes.
const NODE_OVERHEAD: usize = 8 + 1 + 24 * 3;

/// A single node in the skip list.
///
/// Each node has `height` forward pointers. Level 0 contains all nodes
/// (a regular linked list). Higher levels skip over nodes, enabling
/// O(log n) average-case search.
///
/// ```text
/// Level 3:  HEAD ──────────────────────────────► 50 ──────────► NIL
/// Level 2:  HEAD ──────────► 20 ────────────────► 50 ──────────► NIL
/// Level 1:  HEAD ──► 10 ──► 20 ────► 35 ────────► 50 ──► 60 ──► NIL
/// Level 0:  HEAD ──► 10 ──► 20 ──► 25 ──► 35 ──► 50 ──► 60 ──► 70 ► NIL
/// ```
///
/// Pointers are indices into the arena (`SkipList::nodes`). Nodes are never
/// removed, so an index stays valid for the lifetime of the list.
struct SkipNode {
    key: Vec<u8>,
    sequence: SequenceNumber,
    value_type: ValueType,
    value: Vec<u8>,
    forward: Vec<Option<usize>>,
}

/// A borrowed view of one version stored in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// A probabilistic sorted data structure keyed by (user key ASC, sequence DESC).
///
/// Several versions of the same user key coexist; the newest one sorts first.
///
/// Average case: O(log n) insert, O(log n) lookup, O(n) iteration.
pub struct SkipList {
    nodes: Vec<SkipNode>,
    height: usize,
    len: usize,
    size_bytes: usize,
}

impl SkipList {
    /// Create a new empty skip list.
    pub fn new() -> Self {
        let head = SkipNode {
            key: Vec::new(),
            sequence: 0,
            value_type: ValueType::Put,
            value: Vec::new(),
            forward: vec![None; MAX_HEIGHT],
        };
        SkipList {
            nodes: vec![head],
            height: 1,
            len: 0,
            size_bytes: 0,
        }
    }

    /// Insert one version. Re-inserting an existing (key, sequence) pair
    /// replaces its value.
    pub fn insert(&mut self, key: &[u8], sequence: SequenceNumber, value_type: ValueType, value: &[u8]) {
        let mut prev = [HEAD; MAX_HEIGHT];
        if let Some(found) = self.find_greater_or_equal(key, sequence, Some(&mut prev)) {
            let node = &mut self.nodes[found];
            if node.key == key && node.sequence == sequence {
                self.size_bytes = self.size_bytes - node.value.len() + value.len();
                node.value = value.to_vec();
                node.value_type = value_type;
                return;
            }
        }

        let height = Self::random_height();
        if height > self.height {
            // prev[] above the old height already points at HEAD
            self.height = height;
        }

        let index = self.nodes.len();
        let mut forward = vec![None; height];
        for (level, slot) in forward.iter_mut().enumerate() {
            *slot = self.nodes[prev[level]].forward[level];
            self.nodes[prev[level]].forward[level] = Some(index);
        }

        self.size_bytes += key.len() + value.len() + NODE_OVERHEAD;
        self.len += 1;
        self.nodes.push(SkipNode {
            key: key.to_vec(),
            sequence,
            value_type,
            value: value.to_vec(),
            forward,
        });
    }

    /// Newest version of `key` whose sequence is ≤ `read_sequence`.
    pub fn get(&self, key: &[u8], read_sequence: SequenceNumber) -> Option<EntryRef<'_>> {
        let index = self.find_greater_or_equal(key, read_sequence, None)?;
        let entry = self.entry(index);
        (entry.key == key).then_some(entry)
    }

    /// Number of entries (versions) in the skip list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the skip list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Approximate memory usage in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Create an iterator over all entries in sorted order.
    /// Traverses level 0 (the bottom level contains all entries).
    pub fn iter(&self) -> SkipListIterator<'_> {
        SkipListIterator {
            list: self,
            current: self.first(),
        }
    }

    /// Arena index of the first entry.
    pub(crate) fn first(&self) -> Option<usize> {
        self.nodes[HEAD].forward[0]
    }

    /// Arena index of the entry after `index`.
    pub(crate) fn next_of(&self, index: usize) -> Option<usize> {
        self.nodes[index].forward[0]
    }

    /// Arena index of the first entry at or after (key, sequence).
    pub(crate) fn seek(&self, key: &[u8], sequence: SequenceNumber) -> Option<usize> {
        self.find_greater_or_equal(key, sequence, None)
    }

    pub(crate) fn entry(&self, index: usize) -> EntryRef<'_> {
        let node = &self.nodes[index];
        EntryRef {
            key: &node.key,
            value: &node.value,
            sequence: node.sequence,
            value_type: node.value_type,
        }
    }

    /// Walk from the highest level down, recording the last node before the
    /// target at each level in `prev`.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        sequence: SequenceNumber,
        mut prev: Option<&mut [usize; MAX_HEIGHT]>,
    ) -> Option<usize> {
        let mut x = HEAD;
        let mut level = self.height - 1;
        loop {
            let next = self.nodes[x].forward[level];
            match next {
                Some(n) if self.is_before(n, key, sequence) => x = n,
                _ => {
                    if let Some(prev) = prev.as_deref_mut() {
                        prev[level] = x;
                    }
                    if level == 0 {
                        return next;
                    }
                    level -= 1;
                }
            }
        }
    }

    fn is_before(&self, index: usize, key: &[u8], sequence: SequenceNumber) -> bool {
        let node = &self.nodes[index];
        compare_internal(&node.key, node.sequence, key, sequence) == Ordering::Less
    }

    /// Each level has a 1/4 probability of being added.
    fn random_height() -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_bool(BRANCHING_P) {
            height += 1;
        }
        height
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over skip list entries in sorted order.
///
/// Simply follows level 0 forward pointers — level 0 is a sorted linked list
/// containing every entry.
pub struct SkipListIterator<'a> {
    list: &'a SkipList,
    current: Option<usize>,
}

impl<'a> Iterator for SkipListIterator<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current?;
        self.current = self.list.next_of(index);
        Some(self.list.entry(index))
    }
}
