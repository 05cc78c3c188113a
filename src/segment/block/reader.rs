use std::sync::Arc;

use bytes::Buf;

use crate::error::{Error, Result};
use crate::iterator::StorageIterator;
use crate::segment::block::{CHECKSUM_SIZE, COUNT_SIZE, ENTRY_HEADER_SIZE, OFFSET_SIZE};
use crate::types::{Entry, SequenceNumber, ValueType};

/// Where one entry lives inside `Block::data`, parsed once at decode time.
#[derive(Debug, Clone, Copy)]
struct Slot {
    key_start: u32,
    key_len: u16,
    value_len: u32,
    sequence: SequenceNumber,
    value_type: ValueType,
}

/// A decoded, checksum-verified data block.
///
/// Every offset and length is validated in `decode`, so lookups and
/// iteration never touch out-of-range bytes.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    slots: Vec<Slot>,
}

/// A borrowed view of one entry in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl BlockEntry<'_> {
    pub fn to_entry(&self) -> Entry {
        Entry {
            key: self.key.to_vec(),
            value: self.value.to_vec(),
            sequence: self.sequence,
            value_type: self.value_type,
        }
    }
}

impl Block {
    /// Decode a block as produced by `BlockBuilder::build`, checksum included.
    pub fn decode(mut data: Vec<u8>) -> Result<Self> {
        if data.len() < COUNT_SIZE + CHECKSUM_SIZE {
            return Err(Error::corruption("block too short"));
        }

        let body_len = data.len() - CHECKSUM_SIZE;
        let stored = (&data[body_len..]).get_u32_le();
        let actual = crc32fast::hash(&data[..body_len]);
        if stored != actual {
            return Err(Error::corruption(format!(
                "block checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }

        let count = (&data[body_len - COUNT_SIZE..body_len]).get_u32_le() as usize;
        let offsets_len = count
            .checked_mul(OFFSET_SIZE)
            .filter(|len| len + COUNT_SIZE <= body_len)
            .ok_or_else(|| Error::corruption(format!("block entry count {count} exceeds block")))?;
        let entries_end = body_len - COUNT_SIZE - offsets_len;

        let mut offsets = &data[entries_end..body_len - COUNT_SIZE];
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = offsets.get_u32_le() as usize;
            slots.push(parse_slot(&data[..entries_end], offset)?);
        }

        data.truncate(entries_end);
        Ok(Block { data, slots })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes charged against the block cache for this block.
    pub fn charge(&self) -> usize {
        self.data.len() + self.slots.len() * std::mem::size_of::<Slot>()
    }

    pub fn entry(&self, index: usize) -> BlockEntry<'_> {
        let slot = &self.slots[index];
        let key_start = slot.key_start as usize;
        let key_end = key_start + slot.key_len as usize;
        let value_end = key_end + slot.value_len as usize;
        BlockEntry {
            key: &self.data[key_start..key_end],
            value: &self.data[key_end..value_end],
            sequence: slot.sequence,
            value_type: slot.value_type,
        }
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        self.entry(index).key
    }

    /// Index of the first entry whose key is >= `key` (binary search).
    pub fn seek_index(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.slots.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Point lookup. Tombstones are returned as entries; the caller decides.
    pub fn lookup(&self, key: &[u8]) -> Option<BlockEntry<'_>> {
        let index = self.seek_index(key);
        (index < self.len() && self.key_at(index) == key).then(|| self.entry(index))
    }

    /// Value for `key`, or None if absent or tombstoned.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.lookup(key)
            .filter(|e| e.value_type == ValueType::Put)
            .map(|e| e.value)
    }

    /// Iterate the block from its first entry.
    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator::new(Arc::clone(self))
    }
}

fn parse_slot(entries: &[u8], offset: usize) -> Result<Slot> {
    if offset + ENTRY_HEADER_SIZE > entries.len() {
        return Err(Error::corruption(format!("block entry offset {offset} out of range")));
    }
    let mut header = &entries[offset..offset + ENTRY_HEADER_SIZE];
    let key_len = header.get_u16_le();
    let value_len = header.get_u32_le();
    let sequence = header.get_u64_le();
    let value_type = ValueType::from_u8(header.get_u8())?;

    let key_start = offset + ENTRY_HEADER_SIZE;
    if key_start + key_len as usize + value_len as usize > entries.len() {
        return Err(Error::corruption(format!("block entry at {offset} overruns block")));
    }
    Ok(Slot {
        key_start: key_start as u32,
        key_len,
        value_len,
        sequence,
        value_type,
    })
}

/// Iterator over one block. Holds the block by `Arc`, which keeps it pinned
/// in the block cache for as long as the iterator lives.
pub struct BlockIterator {
    block: Arc<Block>,
    index: usize,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        BlockIterator { block, index: 0 }
    }

    pub fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn current(&self) -> BlockEntry<'_> {
        self.block.entry(self.index)
    }
}

impl StorageIterator for BlockIterator {
    fn key(&self) -> &[u8] {
        self.current().key
    }

    fn value(&self) -> &[u8] {
        self.current().value
    }

    fn sequence(&self) -> SequenceNumber {
        self.current().sequence
    }

    fn value_type(&self) -> ValueType {
        self.current().value_type
    }

    fn is_valid(&self) -> bool {
        self.index < self.block.len()
    }

    fn next(&mut self) -> Result<()> {
        if self.is_valid() {
            self.index += 1;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.index = self.block.seek_index(key);
        Ok(())
    }
}
