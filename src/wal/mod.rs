pub mod reader;
pub mod record;
pub mod writer;

use std::path::{Path, PathBuf};

pub use reader::{WALReader, WalReplay};
pub use record::{RecordType, WALRecord};
pub use writer::{LogFile, WALManager, WALWriter};

/// Controls when the WAL is fsync'd to disk.
///
/// Trade-off: durability vs throughput.
///   - EveryWrite: zero data loss, ~10x slower (each fsync waits for disk)
///   - EveryNWrites: batched durability, lose up to N writes on crash
///   - Manual: only `flush()`, rotation and close fsync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every record. Safest, slowest.
    EveryWrite,
    /// fsync every N records. Batched durability.
    EveryNWrites(usize),
    /// fsync only when asked to.
    Manual,
}

pub(crate) const WAL_EXTENSION: &str = "log";

pub(crate) fn wal_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:06}.{WAL_EXTENSION}"))
}

/// Parse `000042.log` into 42.
pub(crate) fn parse_wal_id(path: &Path) -> Option<u64> {
    if path.extension()? != WAL_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// All WAL file ids in `dir`, ascending.
pub(crate) fn list_wal_ids(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        if let Some(id) = parse_wal_id(&entry?.path()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
