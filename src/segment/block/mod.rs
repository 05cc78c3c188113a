pub mod builder;
pub mod reader;

pub use builder::BlockBuilder;
pub use reader::{Block, BlockEntry, BlockIterator};

/// key_len (2B) + val_len (4B) + sequence (8B) + kind (1B)
pub(crate) const ENTRY_HEADER_SIZE: usize = 2 + 4 + 8 + 1;
pub(crate) const OFFSET_SIZE: usize = 4;
pub(crate) const COUNT_SIZE: usize = 4;
pub(crate) const CHECKSUM_SIZE: usize = 4;
