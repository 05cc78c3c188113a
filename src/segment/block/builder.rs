use bytes::BufMut;

use crate::segment::block::{CHECKSUM_SIZE, COUNT_SIZE, ENTRY_HEADER_SIZE, OFFSET_SIZE};
use crate::types::{SequenceNumber, ValueType};

/// Accumulates sorted entries and serializes them into a block.
///
/// A block is typically 4KB (matching OS page size / SSD block size).
/// Contains sorted entries + an offset array for binary search, followed by
/// a checksum over everything before it.
///
/// On-disk layout of a block:
/// ```text
/// ┌───────────────────────────────────────────────────────────────┐
/// │ Entry 0: [key_len(2B)][val_len(4B)][seq(8B)][kind(1B)][key][value] │
/// │ Entry 1: ...                                                  │
/// │ Entry N: ...                                                  │
/// ├───────────────────────────────────────────────────────────────┤
/// │ Offset array: [off_0(4B)][off_1(4B)]...[off_N(4B)]            │
/// │ Num entries (4B)                                              │
/// ├───────────────────────────────────────────────────────────────┤
/// │ crc32 of all bytes above (4B)                                 │
/// └───────────────────────────────────────────────────────────────┘
/// ```
///
/// The offset array at the end enables binary search without parsing
/// every entry — jump to offsets[mid], read the key, compare.
pub struct BlockBuilder {
    data: Vec<u8>,
    offsets: Vec<u32>,
    block_size: usize,
}

impl BlockBuilder {
    /// Create a new block builder with target block size.
    pub fn new(block_size: usize) -> Self {
        BlockBuilder {
            data: Vec::with_capacity(block_size),
            offsets: Vec::new(),
            block_size,
        }
    }

    /// Add one entry to the block.
    /// Returns false if the block is full (entry doesn't fit).
    /// First entry is always accepted even if it exceeds block_size.
    /// Entries MUST be added in sorted key order.
    pub fn add(&mut self, key: &[u8], value: &[u8], sequence: SequenceNumber, value_type: ValueType) -> bool {
        let entry_size = ENTRY_HEADER_SIZE + key.len() + value.len() + OFFSET_SIZE;

        // Always accept the first entry so we never produce an empty block.
        if !self.offsets.is_empty() && self.estimated_size() + entry_size > self.block_size {
            return false;
        }

        self.offsets.push(self.data.len() as u32);

        self.data.put_u16_le(key.len() as u16);
        self.data.put_u32_le(value.len() as u32);
        self.data.put_u64_le(sequence);
        self.data.put_u8(value_type as u8);
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(value);

        true
    }

    /// Finalize the block: append offset array, entry count and checksum.
    pub fn build(self) -> Vec<u8> {
        let mut block = self.data;

        for offset in &self.offsets {
            block.put_u32_le(*offset);
        }
        block.put_u32_le(self.offsets.len() as u32);

        let checksum = crc32fast::hash(&block);
        block.put_u32_le(checksum);
        block
    }

    /// Current estimated size of the block (data + offsets + count + checksum).
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * OFFSET_SIZE + COUNT_SIZE + CHECKSUM_SIZE
    }

    /// Whether the block is empty (no entries added).
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}
