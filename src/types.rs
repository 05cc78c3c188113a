use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Raw key bytes.
pub type Key = Vec<u8>;

/// Raw value bytes.
pub type Value = Vec<u8>;

/// Monotonic write counter assigned at WAL-append time.
pub type SequenceNumber = u64;

/// Distinguishes puts from deletes in the storage engine.
/// A Delete writes a tombstone — the key isn't removed, it's marked as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// A normal put operation.
    Put = 0x01,
    /// A delete (tombstone marker).
    Delete = 0x02,
}

impl ValueType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(ValueType::Put),
            0x02 => Ok(ValueType::Delete),
            _ => Err(Error::Corruption(format!("invalid value type: {byte}"))),
        }
    }
}

/// Internal key format: user key + sequence number + value type.
///
/// Ordering: (user_key ASC, sequence DESC).
/// This ensures the newest version of a key always comes first during merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Key,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: Key, sequence: SequenceNumber, value_type: ValueType) -> Self {
        InternalKey {
            user_key,
            sequence,
            value_type,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_internal(&self.user_key, self.sequence, &other.user_key, other.sequence)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two (key, sequence) pairs in internal-key order.
pub fn compare_internal(
    a_key: &[u8],
    a_seq: SequenceNumber,
    b_key: &[u8],
    b_seq: SequenceNumber,
) -> Ordering {
    a_key.cmp(b_key).then_with(|| b_seq.cmp(&a_seq))
}

/// A fully materialized record: one version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl Entry {
    pub fn put(key: Key, value: Value, sequence: SequenceNumber) -> Self {
        Entry {
            key,
            value,
            sequence,
            value_type: ValueType::Put,
        }
    }

    pub fn tombstone(key: Key, sequence: SequenceNumber) -> Self {
        Entry {
            key,
            value: Vec::new(),
            sequence,
            value_type: ValueType::Delete,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Delete
    }

    /// The user-visible value, `None` for tombstones.
    pub fn into_value(self) -> Option<Value> {
        match self.value_type {
            ValueType::Put => Some(self.value),
            ValueType::Delete => None,
        }
    }
}
