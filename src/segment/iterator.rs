use std::sync::Arc;

use crate::error::Result;
use crate::iterator::StorageIterator;
use crate::segment::block::BlockIterator;
use crate::segment::reader::Segment;
use crate::types::{SequenceNumber, ValueType};

/// Streams a segment's entries block by block.
///
/// Only the current block is held (pinned in the cache); the next one is
/// loaded when the current one runs out. An optional exclusive upper bound
/// ends the iteration early.
pub struct SegmentIterator {
    segment: Arc<Segment>,
    block_idx: usize,
    block_iter: Option<BlockIterator>,
    end: Option<Vec<u8>>,
}

impl SegmentIterator {
    pub(crate) fn new(segment: Arc<Segment>, end: Option<Vec<u8>>) -> Result<Self> {
        let mut iter = SegmentIterator {
            segment,
            block_idx: 0,
            block_iter: None,
            end,
        };
        iter.load_block(0)?;
        iter.skip_exhausted_blocks()?;
        Ok(iter)
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    fn load_block(&mut self, block_idx: usize) -> Result<()> {
        self.block_idx = block_idx;
        self.block_iter = if block_idx < self.segment.num_blocks() {
            Some(self.segment.read_block(block_idx)?.iter())
        } else {
            None
        };
        Ok(())
    }

    /// Move forward until positioned on an entry or out of blocks.
    fn skip_exhausted_blocks(&mut self) -> Result<()> {
        while let Some(block_iter) = &self.block_iter {
            if block_iter.is_valid() {
                break;
            }
            self.load_block(self.block_idx + 1)?;
        }
        Ok(())
    }

    fn inner(&self) -> &BlockIterator {
        self.block_iter
            .as_ref()
            .expect("segment iterator used while invalid")
    }
}

impl StorageIterator for SegmentIterator {
    fn key(&self) -> &[u8] {
        self.inner().key()
    }

    fn value(&self) -> &[u8] {
        self.inner().value()
    }

    fn sequence(&self) -> SequenceNumber {
        self.inner().sequence()
    }

    fn value_type(&self) -> ValueType {
        self.inner().value_type()
    }

    fn is_valid(&self) -> bool {
        match &self.block_iter {
            Some(block_iter) if block_iter.is_valid() => {
                self.end.as_deref().is_none_or(|end| block_iter.key() < end)
            }
            _ => false,
        }
    }

    fn next(&mut self) -> Result<()> {
        if let Some(block_iter) = self.block_iter.as_mut() {
            block_iter.next()?;
            self.skip_exhausted_blocks()?;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let block_idx = self.segment.block_for(key).unwrap_or(0);
        self.load_block(block_idx)?;
        if let Some(block_iter) = self.block_iter.as_mut() {
            block_iter.seek(key)?;
        }
        self.skip_exhausted_blocks()
    }
}
