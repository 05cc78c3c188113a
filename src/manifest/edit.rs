use bytes::BufMut;

use crate::error::{Error, Result};
use crate::segment::footer::{take_u8, take_u32, take_u64};
use crate::segment::SegmentMeta;
use crate::types::SequenceNumber;

const SNAPSHOT: u8 = 0x01;
const FLUSH: u8 = 0x02;
const COMPACTION: u8 = 0x03;

/// One atomic change to the level set, as logged in the MANIFEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionEdit {
    /// The full level set. Written as the only record when the manifest is
    /// rewritten at open.
    Snapshot {
        segments: Vec<SegmentMeta>,
        next_segment_id: u64,
        flushed_sequence: SequenceNumber,
    },

    /// A memtable became an L0 segment. Every write up to
    /// `flushed_sequence` is now durable in segments.
    Flush {
        segment: SegmentMeta,
        flushed_sequence: SequenceNumber,
        next_segment_id: u64,
    },

    /// Inputs `(level, id)` replaced by `added`.
    Compaction {
        removed: Vec<(u32, u64)>,
        added: Vec<SegmentMeta>,
        next_segment_id: u64,
    },
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            VersionEdit::Snapshot {
                segments,
                next_segment_id,
                flushed_sequence,
            } => {
                buf.put_u8(SNAPSHOT);
                buf.put_u64_le(*next_segment_id);
                buf.put_u64_le(*flushed_sequence);
                buf.put_u32_le(segments.len() as u32);
                for meta in segments {
                    meta.encode_into(&mut buf);
                }
            }

            VersionEdit::Flush {
                segment,
                flushed_sequence,
                next_segment_id,
            } => {
                buf.put_u8(FLUSH);
                buf.put_u64_le(*next_segment_id);
                buf.put_u64_le(*flushed_sequence);
                segment.encode_into(&mut buf);
            }

            VersionEdit::Compaction {
                removed,
                added,
                next_segment_id,
            } => {
                buf.put_u8(COMPACTION);
                buf.put_u64_le(*next_segment_id);
                buf.put_u32_le(removed.len() as u32);
                for (level, id) in removed {
                    buf.put_u32_le(*level);
                    buf.put_u64_le(*id);
                }
                buf.put_u32_le(added.len() as u32);
                for meta in added {
                    meta.encode_into(&mut buf);
                }
            }
        }

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let edit_type = take_u8(&mut buf, "edit type")?;

        let edit = match edit_type {
            SNAPSHOT => {
                let next_segment_id = take_u64(&mut buf, "next segment id")?;
                let flushed_sequence = take_u64(&mut buf, "flushed sequence")?;
                let count = take_u32(&mut buf, "segment count")?;
                let mut segments = Vec::new();
                for _ in 0..count {
                    segments.push(SegmentMeta::decode_from(&mut buf)?);
                }
                VersionEdit::Snapshot {
                    segments,
                    next_segment_id,
                    flushed_sequence,
                }
            }

            FLUSH => {
                let next_segment_id = take_u64(&mut buf, "next segment id")?;
                let flushed_sequence = take_u64(&mut buf, "flushed sequence")?;
                let segment = SegmentMeta::decode_from(&mut buf)?;
                VersionEdit::Flush {
                    segment,
                    flushed_sequence,
                    next_segment_id,
                }
            }

            COMPACTION => {
                let next_segment_id = take_u64(&mut buf, "next segment id")?;
                let removed_count = take_u32(&mut buf, "removed count")?;
                let mut removed = Vec::new();
                for _ in 0..removed_count {
                    let level = take_u32(&mut buf, "removed level")?;
                    let id = take_u64(&mut buf, "removed id")?;
                    removed.push((level, id));
                }
                let added_count = take_u32(&mut buf, "added count")?;
                let mut added = Vec::new();
                for _ in 0..added_count {
                    added.push(SegmentMeta::decode_from(&mut buf)?);
                }
                VersionEdit::Compaction {
                    removed,
                    added,
                    next_segment_id,
                }
            }

            other => return Err(Error::corruption(format!("unknown version edit type {other:#04x}"))),
        };

        if !buf.is_empty() {
            return Err(Error::corruption(format!(
                "{} trailing bytes after version edit",
                buf.len()
            )));
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: u64, level: u32) -> SegmentMeta {
        SegmentMeta {
            id,
            level,
            min_key: b"a".to_vec(),
            max_key: b"m".to_vec(),
            file_size: 4096,
            entry_count: 12,
            tombstone_count: 2,
            max_sequence: 40,
        }
    }

    #[test]
    fn compaction_edit_roundtrip() {
        let edit = VersionEdit::Compaction {
            removed: vec![(0, 3), (0, 4), (1, 2)],
            added: vec![meta(7, 1), meta(8, 1)],
            next_segment_id: 9,
        };
        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        assert!(VersionEdit::decode(&[0x7F]).unwrap_err().is_corruption());
        assert!(VersionEdit::decode(&[]).unwrap_err().is_corruption());
    }
}
