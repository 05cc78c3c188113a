use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::SequenceNumber;

/// Magic number to identify segment files.
pub const SEGMENT_MAGIC: u64 = 0x5449_4552_4B56_5347; // "TIERKVSG"

/// Metadata about a segment file. Written into the segment's meta block and
/// carried by manifest edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Unique segment identifier.
    pub id: u64,
    /// Level this segment belongs to (0 = freshly flushed).
    pub level: u32,
    /// Smallest key in the segment.
    pub min_key: Vec<u8>,
    /// Largest key in the segment.
    pub max_key: Vec<u8>,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of entries (including tombstones).
    pub entry_count: u64,
    pub tombstone_count: u64,
    /// Highest sequence number stored in the segment.
    pub max_sequence: SequenceNumber,
}

impl SegmentMeta {
    /// Whether [min_key, max_key] intersects [start, end] (inclusive).
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.min_key.as_slice() <= end && start <= self.max_key.as_slice()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }

    /// Exact size of `encode_into` output.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + 4 + self.min_key.len() + 4 + self.max_key.len() + 8 * 4
    }

    /// Format: [id(8B)][level(4B)][min_len(4B)][min_key][max_len(4B)][max_key]
    ///         [file_size(8B)][entry_count(8B)][tombstone_count(8B)][max_sequence(8B)]
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.level);
        buf.put_u32_le(self.min_key.len() as u32);
        buf.extend_from_slice(&self.min_key);
        buf.put_u32_le(self.max_key.len() as u32);
        buf.extend_from_slice(&self.max_key);
        buf.put_u64_le(self.file_size);
        buf.put_u64_le(self.entry_count);
        buf.put_u64_le(self.tombstone_count);
        buf.put_u64_le(self.max_sequence);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one meta record from the front of `buf`, advancing it.
    pub fn decode_from(buf: &mut &[u8]) -> Result<Self> {
        let id = take_u64(buf, "segment id")?;
        let level = take_u32(buf, "segment level")?;
        let min_key = take_bytes(buf, "min key")?;
        let max_key = take_bytes(buf, "max key")?;
        let file_size = take_u64(buf, "file size")?;
        let entry_count = take_u64(buf, "entry count")?;
        let tombstone_count = take_u64(buf, "tombstone count")?;
        let max_sequence = take_u64(buf, "max sequence")?;
        Ok(SegmentMeta {
            id,
            level,
            min_key,
            max_key,
            file_size,
            entry_count,
            tombstone_count,
            max_sequence,
        })
    }
}

pub(crate) fn take_u8(buf: &mut &[u8], what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::corruption(format!("truncated {what}")));
    }
    Ok(buf.get_u8())
}

pub(crate) fn take_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::corruption(format!("truncated {what}")));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn take_u64(buf: &mut &[u8], what: &str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::corruption(format!("truncated {what}")));
    }
    Ok(buf.get_u64_le())
}

/// u32 length prefix followed by that many bytes.
pub(crate) fn take_bytes(buf: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    let len = take_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(Error::corruption(format!("truncated {what}")));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

/// An entry in the segment's index block.
/// Maps a block's first key to its location in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// First (smallest) key in the block.
    pub first_key: Vec<u8>,
    /// Byte offset of the block in the file.
    pub offset: u64,
    /// Size of the block in bytes, checksum trailer included.
    pub size: u64,
}

impl IndexEntry {
    /// Encode this index entry to bytes.
    /// Format: [key_len(2B)][key][offset(8B)][size(8B)]
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u16_le(self.first_key.len() as u16);
        buf.extend_from_slice(&self.first_key);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.first_key.len() + 16);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode an index entry from bytes, returning (entry, bytes_consumed).
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(Error::corruption("index entry too short"));
        }
        let mut buf = data;
        let key_len = buf.get_u16_le() as usize;
        let total = 2 + key_len + 16;
        if data.len() < total {
            return Err(Error::corruption("index entry truncated"));
        }
        let first_key = buf[..key_len].to_vec();
        buf.advance(key_len);
        let offset = buf.get_u64_le();
        let size = buf.get_u64_le();
        Ok((
            IndexEntry {
                first_key,
                offset,
                size,
            },
            total,
        ))
    }
}

/// The footer sits at the end of the segment file.
/// It tells the reader where to find the bloom, index and meta blocks.
///
/// ```text
/// ┌──────────────────────────────────────┐
/// │ Bloom block offset (8B)              │
/// │ Bloom block size (8B)                │  size 0 = no filter
/// │ Index block offset (8B)              │
/// │ Index block size (8B)                │
/// │ Meta block offset (8B)               │
/// │ Meta block size (8B)                 │
/// │ Magic number (8B)                    │
/// └──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub bloom_block_offset: u64,
    pub bloom_block_size: u64,
    pub index_block_offset: u64,
    pub index_block_size: u64,
    pub meta_block_offset: u64,
    pub meta_block_size: u64,
    pub magic: u64,
}

impl Footer {
    /// Size of the footer in bytes (fixed).
    pub const SIZE: usize = 8 * 7; // 56 bytes

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u64_le(self.bloom_block_offset);
        buf.put_u64_le(self.bloom_block_size);
        buf.put_u64_le(self.index_block_offset);
        buf.put_u64_le(self.index_block_size);
        buf.put_u64_le(self.meta_block_offset);
        buf.put_u64_le(self.meta_block_size);
        buf.put_u64_le(self.magic);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::corruption("footer too short"));
        }
        let mut buf = data;
        let footer = Footer {
            bloom_block_offset: buf.get_u64_le(),
            bloom_block_size: buf.get_u64_le(),
            index_block_offset: buf.get_u64_le(),
            index_block_size: buf.get_u64_le(),
            meta_block_offset: buf.get_u64_le(),
            meta_block_size: buf.get_u64_le(),
            magic: buf.get_u64_le(),
        };

        if footer.magic != SEGMENT_MAGIC {
            return Err(Error::corruption(format!(
                "bad magic: expected {:#x}, got {:#x}",
                SEGMENT_MAGIC, footer.magic
            )));
        }
        Ok(footer)
    }

    /// Every block the footer points at must end before the footer itself.
    pub fn validate(&self, file_size: u64) -> Result<()> {
        let body = file_size.saturating_sub(Self::SIZE as u64);
        for (name, offset, size) in [
            ("bloom", self.bloom_block_offset, self.bloom_block_size),
            ("index", self.index_block_offset, self.index_block_size),
            ("meta", self.meta_block_offset, self.meta_block_size),
        ] {
            if offset.checked_add(size).is_none_or(|end| end > body) {
                return Err(Error::corruption(format!(
                    "{name} block [{offset}, +{size}) outside file of {file_size} bytes"
                )));
            }
        }
        Ok(())
    }
}
