//! Immutable sorted segment files.
//!
//! ```text
//! ┌──────────────┬─────┬──────────────┬──────────────┬─────────────┬─────────────┬────────────┐
//! │ data block 0 │ ... │ data block N │ bloom filter │ index block │ meta block  │ footer(56B)│
//! └──────────────┴─────┴──────────────┴──────────────┴─────────────┴─────────────┴────────────┘
//! ```
//!
//! Files live at `segments/<level>/<id>.seg`. A segment holds at most one
//! version per key and is never modified after `SegmentBuilder::finish`.

pub mod block;
pub mod builder;
pub mod footer;
pub mod iterator;
pub mod reader;

use std::path::{Path, PathBuf};

pub use builder::SegmentBuilder;
pub use footer::{Footer, IndexEntry, SEGMENT_MAGIC, SegmentMeta};
pub use iterator::SegmentIterator;
pub use reader::{Segment, SegmentLookup};

pub(crate) const SEGMENT_EXTENSION: &str = "seg";

/// `segments/` under the engine directory.
pub fn segments_dir(root: &Path) -> PathBuf {
    root.join("segments")
}

/// `segments/<level>/<id:06>.seg`
pub fn segment_path(root: &Path, level: u32, id: u64) -> PathBuf {
    segments_dir(root)
        .join(level.to_string())
        .join(format!("{id:06}.{SEGMENT_EXTENSION}"))
}

/// Every segment file on disk as `(level, id, path)`.
pub(crate) fn list_segment_files(root: &Path) -> std::io::Result<Vec<(u32, u64, PathBuf)>> {
    let mut found = Vec::new();
    let dir = segments_dir(root);
    if !dir.exists() {
        return Ok(found);
    }
    for level_dir in std::fs::read_dir(dir)? {
        let level_dir = level_dir?.path();
        let Some(level) = level_dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        for file in std::fs::read_dir(&level_dir)? {
            let path = file?.path();
            if path.extension().is_none_or(|ext| ext != SEGMENT_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                found.push((level, id, path));
            }
        }
    }
    Ok(found)
}
