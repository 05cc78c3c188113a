use std::sync::Arc;

use crate::manifest::Version;
use crate::memtable::MemTable;

/// A memtable that no longer takes writes, waiting for flush.
#[derive(Clone)]
pub(crate) struct FrozenMemTable {
    pub table: Arc<MemTable>,
    /// Active WAL id at freeze time. Every WAL file below it holds only
    /// records of this table or older ones.
    pub wal_floor: u64,
}

/// Everything a read needs, published as one `Arc` so readers never see
/// a memtable swap and a version swap half applied.
#[derive(Clone)]
pub(crate) struct LsmState {
    pub active: Arc<MemTable>,
    /// Newest first.
    pub immutable: Vec<FrozenMemTable>,
    pub version: Arc<Version>,
}

impl LsmState {
    pub fn new(active: Arc<MemTable>, version: Version) -> Self {
        LsmState {
            active,
            immutable: Vec::new(),
            version: Arc::new(version),
        }
    }

    /// The active table moves to the front of the immutable list.
    pub fn with_frozen(&self, next_active: Arc<MemTable>, wal_floor: u64) -> Self {
        let mut immutable = Vec::with_capacity(self.immutable.len() + 1);
        immutable.push(FrozenMemTable {
            table: Arc::clone(&self.active),
            wal_floor,
        });
        immutable.extend(self.immutable.iter().cloned());
        LsmState {
            active: next_active,
            immutable,
            version: Arc::clone(&self.version),
        }
    }

    /// Drop the flushed table and publish the version holding its segment.
    pub fn with_flushed(&self, table_id: u64, version: Version) -> Self {
        LsmState {
            active: Arc::clone(&self.active),
            immutable: self
                .immutable
                .iter()
                .filter(|frozen| frozen.table.id() != table_id)
                .cloned()
                .collect(),
            version: Arc::new(version),
        }
    }

    pub fn with_version(&self, version: Version) -> Self {
        LsmState {
            active: Arc::clone(&self.active),
            immutable: self.immutable.clone(),
            version: Arc::new(version),
        }
    }

    /// The oldest frozen table, which must be flushed first.
    pub fn oldest_frozen(&self) -> Option<&FrozenMemTable> {
        self.immutable.last()
    }
}
