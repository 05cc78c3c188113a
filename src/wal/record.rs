use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::{Entry, SequenceNumber, ValueType};

/// Record type stored in the WAL.
pub type RecordType = ValueType;

/// A single record in the WAL.
///
/// On-disk format:
/// ```text
/// ┌──────────┬─────────┬──────────┬──────────┬────────────┬───────────┬───────────┐
/// │ CRC (4B) │ Len(4B) │ Type(1B) │ Seq (8B) │ KeyLen(4B) │ Key (var) │ Val (var) │
/// └──────────┴─────────┴──────────┴──────────┴────────────┴───────────┴───────────┘
/// ```
///
/// CRC covers everything after the CRC field itself.
/// If CRC doesn't match on read, the record was a partial write (crash mid-write)
/// and recovery stops here — all preceding records are valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WALRecord {
    pub record_type: RecordType,
    pub sequence: SequenceNumber,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

const CRC_SIZE: usize = 4;
const LEN_SIZE: usize = 4;
const TYPE_SIZE: usize = 1;
const SEQ_SIZE: usize = 8;
const KEY_LEN_SIZE: usize = 4;
pub(crate) const HEADER_SIZE: usize = CRC_SIZE + LEN_SIZE + TYPE_SIZE + SEQ_SIZE + KEY_LEN_SIZE;

impl WALRecord {
    /// Create a Put record.
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        WALRecord {
            record_type: RecordType::Put,
            sequence: 0,
            key,
            value,
        }
    }

    /// Create a Delete record.
    pub fn delete(key: Vec<u8>) -> Self {
        WALRecord {
            record_type: RecordType::Delete,
            sequence: 0,
            key,
            value: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = sequence;
        self
    }

    /// Serialize this record to bytes (including CRC header).
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = TYPE_SIZE + SEQ_SIZE + KEY_LEN_SIZE + self.key.len() + self.value.len();
        let mut buf = Vec::with_capacity(CRC_SIZE + LEN_SIZE + payload_len);

        // CRC is filled in last
        buf.put_u32_le(0);
        buf.put_u32_le(payload_len as u32);
        buf.put_u8(self.record_type as u8);
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        let crc = crc32fast::hash(&buf[CRC_SIZE..]);
        buf[0..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserialize a record from the front of `data`. Returns error if the
    /// record is truncated or the CRC doesn't match.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption("record too short"));
        }

        let mut header = &data[..CRC_SIZE + LEN_SIZE];
        let stored_crc = header.get_u32_le();
        let payload_len = header.get_u32_le() as usize;

        let total_len = CRC_SIZE + LEN_SIZE + payload_len;
        if payload_len < TYPE_SIZE + SEQ_SIZE + KEY_LEN_SIZE || data.len() < total_len {
            return Err(Error::corruption("record truncated"));
        }

        if crc32fast::hash(&data[CRC_SIZE..total_len]) != stored_crc {
            return Err(Error::corruption("CRC mismatch"));
        }

        let mut payload = &data[CRC_SIZE + LEN_SIZE..total_len];
        let record_type = RecordType::from_u8(payload.get_u8())?;
        let sequence = payload.get_u64_le();
        let key_len = payload.get_u32_le() as usize;
        if key_len > payload.remaining() {
            return Err(Error::corruption("key length exceeds record"));
        }
        let key = payload[..key_len].to_vec();
        let value = payload[key_len..].to_vec();

        Ok(WALRecord {
            record_type,
            sequence,
            key,
            value,
        })
    }

    /// Size of this record when serialized on disk.
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn into_entry(self) -> Entry {
        Entry {
            key: self.key,
            value: self.value,
            sequence: self.sequence,
            value_type: self.record_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flipped_payload_bit_fails_crc() {
        let mut encoded = WALRecord::put(b"k".to_vec(), b"v".to_vec())
            .with_sequence(7)
            .encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x80;
        assert!(WALRecord::decode(&encoded).unwrap_err().is_corruption());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let record = WALRecord::delete(b"gone".to_vec()).with_sequence(3);
        let mut encoded = record.encode();
        encoded.extend_from_slice(&[0xAB; 10]);
        assert_eq!(WALRecord::decode(&encoded).unwrap(), record);
    }
}
