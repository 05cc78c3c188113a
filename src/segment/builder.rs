use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilterBuilder;
use crate::error::{Error, Result};
use crate::segment::block::BlockBuilder;
use crate::segment::footer::{Footer, IndexEntry, SEGMENT_MAGIC, SegmentMeta};
use crate::types::{SequenceNumber, ValueType};

/// Builds a segment file from a sorted stream of entries.
///
/// Used during:
/// - Memtable flush (sorted memtable → segment)
/// - Compaction (merged iterators → new segments)
///
/// Build process:
/// 1. Add entries one by one (strictly increasing keys, one version each)
/// 2. Entries fill up blocks; when a block is full it's written to disk
/// 3. finish() flushes the last block, writes bloom, index, meta, footer, fsync
///
/// A builder that is dropped without `finish()` leaves a partial file behind;
/// callers either `abandon()` it or let orphan cleanup at open remove it.
pub struct SegmentBuilder {
    path: PathBuf,
    block_builder: BlockBuilder,
    /// Index entries: one per flushed data block.
    index_entries: Vec<IndexEntry>,
    /// Tracks current write position in the file.
    data_offset: u64,
    writer: BufWriter<File>,
    bloom: Option<BloomFilterBuilder>,
    segment_id: u64,
    level: u32,
    block_size: usize,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    entry_count: u64,
    tombstone_count: u64,
    max_sequence: SequenceNumber,
    /// First key of the block currently being filled.
    first_key_in_block: Option<Vec<u8>>,
}

impl SegmentBuilder {
    /// Create a new segment builder that writes to the given path.
    /// `bloom_bits_per_key == 0` writes no filter.
    pub fn new(path: &Path, segment_id: u64, level: u32, block_size: usize, bloom_bits_per_key: usize) -> Result<Self> {
        let file = File::create(path)?;
        Ok(SegmentBuilder {
            path: path.to_path_buf(),
            block_builder: BlockBuilder::new(block_size),
            index_entries: Vec::new(),
            data_offset: 0,
            writer: BufWriter::new(file),
            bloom: (bloom_bits_per_key > 0).then(|| BloomFilterBuilder::new(bloom_bits_per_key)),
            segment_id,
            level,
            block_size,
            min_key: None,
            max_key: None,
            entry_count: 0,
            tombstone_count: 0,
            max_sequence: 0,
            first_key_in_block: None,
        })
    }

    /// Add one entry. Keys MUST be strictly increasing.
    pub fn add(&mut self, key: &[u8], value: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Result<()> {
        if let Some(last) = &self.max_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidArgument(format!(
                    "segment {} keys out of order",
                    self.segment_id
                )));
            }
        }

        if !self.block_builder.add(key, value, sequence, value_type) {
            // Block is full — flush it, then start a fresh one with this entry
            self.flush_block()?;
            self.block_builder.add(key, value, sequence, value_type);
        }
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        self.entry_count += 1;
        if value_type == ValueType::Delete {
            self.tombstone_count += 1;
        }
        self.max_sequence = self.max_sequence.max(sequence);
        if let Some(bloom) = self.bloom.as_mut() {
            bloom.add_key(key);
        }
        Ok(())
    }

    /// Flush the current block to disk and record an index entry.
    fn flush_block(&mut self) -> Result<()> {
        if self.block_builder.is_empty() {
            return Ok(());
        }

        let old_builder = std::mem::replace(&mut self.block_builder, BlockBuilder::new(self.block_size));
        let block_data = old_builder.build();
        let block_size = block_data.len() as u64;

        self.writer.write_all(&block_data)?;

        self.index_entries.push(IndexEntry {
            first_key: self.first_key_in_block.take().unwrap_or_default(),
            offset: self.data_offset,
            size: block_size,
        });

        self.data_offset += block_size;
        Ok(())
    }

    /// Bytes written so far plus the block still being filled.
    pub fn estimated_size(&self) -> u64 {
        self.data_offset + self.block_builder.estimated_size() as u64
    }

    /// Bytes already handed to the file.
    pub fn bytes_written(&self) -> u64 {
        self.data_offset
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the segment: flush last block, write filter, index, meta
    /// and footer, then fsync.
    pub fn finish(mut self) -> Result<SegmentMeta> {
        if self.entry_count == 0 {
            return Err(Error::InvalidArgument(format!(
                "segment {} has no entries",
                self.segment_id
            )));
        }

        // 1. Flush the last data block
        self.flush_block()?;

        // 2. Bloom filter block
        let bloom_block_offset = self.data_offset;
        let bloom_data = self.bloom.take().map(|b| b.build().encode()).unwrap_or_default();
        self.writer.write_all(&bloom_data)?;
        let bloom_block_size = bloom_data.len() as u64;

        // 3. Index block: all index entries back to back
        let index_block_offset = bloom_block_offset + bloom_block_size;
        let mut index_data = Vec::new();
        for entry in &self.index_entries {
            entry.encode_into(&mut index_data);
        }
        let index_block_size = index_data.len() as u64;
        self.writer.write_all(&index_data)?;

        // 4. Meta block; its length is known up front, so it can carry the
        //    final file size
        let meta_block_offset = index_block_offset + index_block_size;
        let mut meta = SegmentMeta {
            id: self.segment_id,
            level: self.level,
            min_key: self.min_key.take().unwrap_or_default(),
            max_key: self.max_key.take().unwrap_or_default(),
            file_size: 0,
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            max_sequence: self.max_sequence,
        };
        let meta_block_size = meta.encoded_len() as u64;
        meta.file_size = meta_block_offset + meta_block_size + Footer::SIZE as u64;
        self.writer.write_all(&meta.encode())?;

        // 5. Footer
        let footer = Footer {
            bloom_block_offset,
            bloom_block_size,
            index_block_offset,
            index_block_size,
            meta_block_offset,
            meta_block_size,
            magic: SEGMENT_MAGIC,
        };
        self.writer.write_all(&footer.encode())?;

        // 6. Flush buffer + fsync to guarantee durability
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        Ok(meta)
    }

    /// Give up on this segment and delete its partial file.
    pub fn abandon(self) {
        let SegmentBuilder { path, writer, .. } = self;
        drop(writer);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete abandoned segment");
        }
    }
}
