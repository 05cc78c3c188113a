//! The MANIFEST: an append-only log of level-set changes.
//!
//! Each record is framed like a WAL record:
//! ```text
//! [crc32(4B)][len(4B)][VersionEdit payload]
//! ```
//! with the CRC covering the length and payload. On open the log is replayed
//! into a `LevelSet`, then rewritten as a single `Snapshot` edit through a
//! temp file, fsync and rename, so a crash mid-rewrite leaves the old file.
//!
//! Only a damaged *final* frame is an edit that never committed. A damaged
//! frame with an intact one after it means committed edits would be lost,
//! and replay fails with `Error::Corruption` before anything acts on the
//! partial level set (orphan removal would otherwise delete live segments).

pub mod edit;
pub mod version;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

pub use edit::VersionEdit;
pub use version::{LevelSet, Version};

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";

/// crc (4B) + len (4B)
const FRAME_HEADER: usize = 8;

/// Rewrite the log as one snapshot after this many appended edits.
const REWRITE_AFTER_EDITS: usize = 1024;

pub struct Manifest {
    root: PathBuf,
    file: File,
    levels: LevelSet,
    edits_since_snapshot: usize,
    /// A failed append may have left bytes in the file; the log must be
    /// rewritten before it takes another edit.
    needs_rewrite: bool,
}

impl Manifest {
    /// Load (or create) the manifest under `root` and compact it.
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let levels = if path.exists() {
            Self::replay(&path)?
        } else {
            LevelSet::new()
        };

        Self::write_snapshot(root, &levels)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Manifest {
            root: root.to_path_buf(),
            file,
            levels,
            edits_since_snapshot: 0,
            needs_rewrite: false,
        })
    }

    /// Rebuild the level set from a manifest file. A torn final record is a
    /// change that never committed and is ignored.
    pub fn replay(path: &Path) -> Result<LevelSet> {
        let data = fs::read(path)?;
        let mut levels = LevelSet::new();
        let mut offset = 0;
        let mut edits = 0;

        while offset < data.len() {
            let Some((payload, consumed)) = decode_frame(&data[offset..]) else {
                let intact_after = (offset + 1..data.len()).find(|start| decode_frame(&data[*start..]).is_some());
                if let Some(next) = intact_after {
                    return Err(Error::corruption(format!(
                        "damaged MANIFEST record at offset {offset} is followed by an intact record at offset {next}"
                    )));
                }
                tracing::warn!(
                    offset,
                    discarded_bytes = data.len() - offset,
                    "discarding torn MANIFEST tail"
                );
                break;
            };
            levels.apply(&VersionEdit::decode(payload)?)?;
            offset += consumed;
            edits += 1;
        }

        tracing::debug!(edits, segments = levels.segments().count(), "replayed MANIFEST");
        Ok(levels)
    }

    /// Append an edit durably, then fold it into the in-memory level set.
    /// The edit is committed once this returns `Ok`.
    ///
    /// A failed append is erased by rewriting the log from the level set,
    /// which never saw the edit, so a later edit cannot commit it by accident.
    pub fn log_and_apply(&mut self, edit: VersionEdit) -> Result<()> {
        if self.needs_rewrite {
            self.rewrite()?;
        }
        let mut next = self.levels.clone();
        next.apply(&edit)?;

        let frame = encode_frame(&edit.encode());
        if let Err(e) = self.file.write_all(&frame).and_then(|()| self.file.sync_data()) {
            self.needs_rewrite = true;
            if let Err(undo) = self.rewrite() {
                tracing::error!(error = %undo, "failed to erase a failed MANIFEST edit; retrying before the next edit");
            }
            return Err(e.into());
        }
        self.levels = next;
        self.edits_since_snapshot += 1;

        if self.edits_since_snapshot >= REWRITE_AFTER_EDITS {
            self.rewrite()?;
        }
        Ok(())
    }

    /// Replace the log with a single snapshot of the current level set.
    pub fn rewrite(&mut self) -> Result<()> {
        Self::write_snapshot(&self.root, &self.levels)?;
        let path = self.root.join(MANIFEST_FILE);
        self.file = OpenOptions::new().append(true).open(path)?;
        self.edits_since_snapshot = 0;
        self.needs_rewrite = false;
        Ok(())
    }

    fn write_snapshot(root: &Path, levels: &LevelSet) -> Result<()> {
        let tmp = root.join(MANIFEST_TMP);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_frame(&levels.snapshot().encode()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, root.join(MANIFEST_FILE))?;
        sync_dir(root)?;
        Ok(())
    }

    pub fn levels(&self) -> &LevelSet {
        &self.levels
    }
}

/// fsync a directory so a rename or create inside it is durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.put_u32_le(payload.len() as u32);
    body.extend_from_slice(payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.put_u32_le(crc32fast::hash(&body));
    frame.extend_from_slice(&body);
    frame
}

/// Returns (payload, bytes consumed), or None if the frame is torn.
fn decode_frame(data: &[u8]) -> Option<(&[u8], usize)> {
    if data.len() < FRAME_HEADER {
        return None;
    }
    let mut header = data;
    let crc = header.get_u32_le();
    let len = header.get_u32_le() as usize;
    let total = FRAME_HEADER.checked_add(len)?;
    if data.len() < total || crc32fast::hash(&data[4..total]) != crc {
        return None;
    }
    Some((&data[FRAME_HEADER..total], total))
}
