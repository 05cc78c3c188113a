use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::segment::block::Block;
use crate::segment::footer::{Footer, IndexEntry, SegmentMeta};
use crate::segment::iterator::SegmentIterator;
use crate::types::Entry;

/// Outcome of a point lookup in one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentLookup {
    /// The segment holds a version of the key (possibly a tombstone).
    Found(Entry),
    /// The bloom filter ruled the key out without touching a data block.
    Filtered,
    /// Outside the key range, or the block was read and the key isn't there.
    Absent,
}

/// An opened segment file. Supports point lookups and range scans.
///
/// On open:
/// 1. Read footer (last 56 bytes) → find bloom, index and meta positions
/// 2. Read and parse index block → Vec<IndexEntry>
/// 3. Read and decode the bloom filter
/// 4. Ready for queries (data blocks read on demand through the block cache)
///
/// Segments are shared as `Arc<Segment>` by every version that lists them.
/// Once a compaction replaces one it is marked obsolete, and the file is
/// deleted when the last `Arc` goes away.
pub struct Segment {
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<IndexEntry>,
    bloom: Option<BloomFilter>,
    meta: SegmentMeta,
    cache: Arc<BlockCache>,
    obsolete: AtomicBool,
}

impl Segment {
    /// Open a segment file and verify its structure.
    pub fn open(path: &Path, cache: Arc<BlockCache>) -> Result<Self> {
        let mut file = File::open(path)?;

        let file_size = file.metadata()?.len();
        if file_size < Footer::SIZE as u64 {
            return Err(corrupt(path, "file too short to contain footer"));
        }

        file.seek(SeekFrom::Start(file_size - Footer::SIZE as u64))?;
        let mut footer_buf = vec![0u8; Footer::SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf).map_err(|e| annotate(path, e))?;
        footer.validate(file_size).map_err(|e| annotate(path, e))?;

        let index_buf = read_range(&mut file, footer.index_block_offset, footer.index_block_size)?;
        let mut index = Vec::new();
        let mut offset = 0usize;
        while offset < index_buf.len() {
            let (entry, consumed) = IndexEntry::decode(&index_buf[offset..]).map_err(|e| annotate(path, e))?;
            index.push(entry);
            offset += consumed;
        }

        let meta_buf = read_range(&mut file, footer.meta_block_offset, footer.meta_block_size)?;
        let meta = SegmentMeta::decode_from(&mut meta_buf.as_slice()).map_err(|e| annotate(path, e))?;
        if meta.file_size != file_size {
            return Err(corrupt(
                path,
                &format!("meta says {} bytes, file has {file_size}", meta.file_size),
            ));
        }
        if index.is_empty() {
            return Err(corrupt(path, "segment has no data blocks"));
        }

        let bloom = if footer.bloom_block_size > 0 {
            let data = read_range(&mut file, footer.bloom_block_offset, footer.bloom_block_size)?;
            Some(BloomFilter::decode(&data).map_err(|e| annotate(path, e))?)
        } else {
            None
        };

        Ok(Segment {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            bloom,
            meta,
            cache,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Point lookup.
    ///
    /// Algorithm:
    /// 1. Check if key is outside [min_key, max_key] → Absent
    /// 2. Bloom filter says no → Filtered
    /// 3. Binary search the sparse index for the last block whose first
    ///    key is <= key
    /// 4. Load that block through the cache and binary search within it
    pub fn lookup(&self, key: &[u8]) -> Result<SegmentLookup> {
        if !self.meta.contains_key(key) {
            return Ok(SegmentLookup::Absent);
        }
        if let Some(bloom) = &self.bloom {
            if !bloom.might_contain(key) {
                return Ok(SegmentLookup::Filtered);
            }
        }

        let Some(block_idx) = self.block_for(key) else {
            return Ok(SegmentLookup::Absent);
        };
        let block = self.read_block(block_idx)?;
        Ok(match block.lookup(key) {
            Some(entry) => SegmentLookup::Found(entry.to_entry()),
            None => SegmentLookup::Absent,
        })
    }

    /// Newest stored version of `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        Ok(match self.lookup(key)? {
            SegmentLookup::Found(entry) => Some(entry),
            SegmentLookup::Filtered | SegmentLookup::Absent => None,
        })
    }

    /// Index of the block that would hold `key`.
    pub(crate) fn block_for(&self, key: &[u8]) -> Option<usize> {
        let after = self.index.partition_point(|e| e.first_key.as_slice() <= key);
        after.checked_sub(1)
    }

    /// Load a data block via the shared block cache.
    pub(crate) fn read_block(&self, block_idx: usize) -> Result<Arc<Block>> {
        let entry = &self.index[block_idx];
        self.cache.get_or_load(self.meta.id, entry.offset, || {
            let data = {
                let mut file = self.file.lock();
                read_range(&mut file, entry.offset, entry.size)?
            };
            Block::decode(data).map_err(|e| annotate(&self.path, e))
        })
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.index.len()
    }

    /// Iterator over the whole segment.
    pub fn iter(self: &Arc<Self>) -> Result<SegmentIterator> {
        SegmentIterator::new(Arc::clone(self), None)
    }

    /// Lazy iterator over keys in `[start, end)`, streaming block by block.
    /// Restartable from any key through `seek`.
    pub fn scan(self: &Arc<Self>, start: &[u8], end: &[u8]) -> Result<SegmentIterator> {
        let mut iter = SegmentIterator::new(Arc::clone(self), Some(end.to_vec()))?;
        crate::iterator::StorageIterator::seek(&mut iter, start)?;
        Ok(iter)
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn level(&self) -> u32 {
        self.meta.level
    }

    pub fn file_size(&self) -> u64 {
        self.meta.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schedule the file for deletion once the last reader lets go.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        self.cache.evict_segment(self.meta.id);
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(segment_id = self.meta.id, "deleted obsolete segment"),
            Err(e) => tracing::warn!(
                segment_id = self.meta.id,
                path = %self.path.display(),
                error = %e,
                "failed to delete obsolete segment"
            ),
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("meta", &self.meta)
            .field("blocks", &self.index.len())
            .finish()
    }
}

fn read_range(file: &mut File, offset: u64, size: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn corrupt(path: &Path, msg: &str) -> Error {
    Error::Corruption(format!("{}: {msg}", path.display()))
}

/// Prefix corruption errors with the file they came from.
fn annotate(path: &Path, e: Error) -> Error {
    match e {
        Error::Corruption(msg) => corrupt(path, &msg),
        other => other,
    }
}
