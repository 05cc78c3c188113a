use xxhash_rust::xxh3::xxh3_128;

use crate::bloom::BloomFilter;

/// Collects key hashes while a segment is written. The key count is only
/// known at `build()`, which is where the filter gets sized.
pub struct BloomFilterBuilder {
    hashes: Vec<u128>,
    bits_per_key: usize,
}

impl BloomFilterBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        BloomFilterBuilder {
            hashes: Vec::new(),
            bits_per_key,
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.hashes.push(xxh3_128(key));
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn build(self) -> BloomFilter {
        let mut filter = BloomFilter::with_bits_per_key(self.hashes.len(), self.bits_per_key);
        for hash in self.hashes {
            filter.insert_hash(hash);
        }
        filter
    }
}
