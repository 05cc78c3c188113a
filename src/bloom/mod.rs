pub mod builder;

pub use builder::BloomFilterBuilder;

use bytes::{Buf, BufMut};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::{Error, Result};

/// Per-segment membership filter. A clear probe bit proves the key was
/// never added; all bits set means "maybe", and the segment must be read.
///
/// Probe positions come from one 128-bit xxh3 hash split into two halves,
/// `pos_i = h1 + i * h2 (mod num_bits)`, so a key is hashed once no matter
/// how many probes the filter uses. At 10 bits per key the filter settles on
/// 7 probes and lets through roughly 1% of absent keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

/// Encoded header: num_hashes (4B) + num_bits (4B).
const HEADER_SIZE: usize = 8;

/// Upper bound on probes per key; more adds CPU without a useful FPR gain.
const MAX_HASHES: u32 = 30;

impl BloomFilter {
    /// Size a filter for `expected_items` keys at a target false-positive
    /// rate: `-n * ln(p) / ln(2)^2` bits.
    ///
    /// # Panics
    /// If `expected_items` is zero or the rate is outside (0, 1).
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "FPR must be in (0, 1)"
        );

        let ln2 = std::f64::consts::LN_2;
        let n = expected_items as f64;
        let bits = -n * false_positive_rate.ln() / (ln2 * ln2);
        Self::with_total_bits(expected_items, bits.ceil() as u64)
    }

    /// Create a filter with a fixed budget of `bits_per_key` bits per key.
    /// This is how segments size their filters (`Options::bloom_bits_per_key`).
    pub fn with_bits_per_key(expected_items: usize, bits_per_key: usize) -> Self {
        let expected_items = expected_items.max(1);
        let bits = (expected_items as u64).saturating_mul(bits_per_key.max(1) as u64);
        Self::with_total_bits(expected_items, bits)
    }

    fn with_total_bits(expected_items: usize, bits: u64) -> Self {
        // At least 64 bits, and small enough for u32 positions.
        let num_bits = bits.clamp(64, u32::MAX as u64 - 63) as u32;

        let per_key = num_bits as f64 / expected_items as f64;
        let num_hashes = (per_key * std::f64::consts::LN_2).round() as u32;
        let num_hashes = num_hashes.clamp(1, MAX_HASHES);

        let num_words = (num_bits as usize).div_ceil(64);
        BloomFilter {
            bits: vec![0u64; num_words],
            num_hashes,
            num_bits,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(xxh3_128(key));
    }

    pub(crate) fn insert_hash(&mut self, hash: u128) {
        let (h1, h2) = split_hash(hash);

        for i in 0..self.num_hashes {
            let (word, mask) = self.probe(h1, h2, i);
            self.bits[word] |= mask;
        }
    }

    /// `false` means the key is absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split_hash(xxh3_128(key));

        (0..self.num_hashes).all(|i| {
            let (word, mask) = self.probe(h1, h2, i);
            self.bits[word] & mask != 0
        })
    }

    /// Filter block layout:
    ///
    /// ```text
    /// [num_hashes(4B)][num_bits(4B)][word_0(8B)]...[word_n(8B)]
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.bits.len() * 8);
        buf.put_u32_le(self.num_hashes);
        buf.put_u32_le(self.num_bits);
        for word in &self.bits {
            buf.put_u64_le(*word);
        }
        buf
    }

    /// Parse a filter block, rejecting headers that disagree with the payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption("bloom filter block too short"));
        }
        let mut buf = data;
        let num_hashes = buf.get_u32_le();
        let num_bits = buf.get_u32_le();

        let num_words = (num_bits as usize).div_ceil(64);
        if num_hashes == 0 || num_bits == 0 || buf.remaining() != num_words * 8 {
            return Err(Error::corruption(format!(
                "bloom filter header mismatch: {num_hashes} hashes, {num_bits} bits, {} payload bytes",
                buf.remaining()
            )));
        }

        let mut bits = Vec::with_capacity(num_words);
        while buf.has_remaining() {
            bits.push(buf.get_u64_le());
        }
        Ok(BloomFilter {
            bits,
            num_hashes,
            num_bits,
        })
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    fn probe(&self, h1: u64, h2: u64, i: u32) -> (usize, u64) {
        let pos = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64;
        ((pos / 64) as usize, 1u64 << (pos % 64))
    }
}

fn split_hash(hash128: u128) -> (u64, u64) {
    (hash128 as u64, (hash128 >> 64) as u64)
}
