// Bloom filters as segments use them: built from key hashes at a fixed
// bits-per-key budget, serialized into the filter block, decoded on open.

use tierkv::bloom::{BloomFilter, BloomFilterBuilder};

fn build(keys: impl IntoIterator<Item = Vec<u8>>, bits_per_key: usize) -> BloomFilter {
    let mut builder = BloomFilterBuilder::new(bits_per_key);
    for key in keys {
        builder.add_key(&key);
    }
    builder.build()
}

/// Fraction of `probes` the filter wrongly lets through.
fn false_positive_rate(bf: &BloomFilter, probes: impl Iterator<Item = Vec<u8>>) -> f64 {
    let (mut hits, mut total) = (0usize, 0usize);
    for key in probes {
        total += 1;
        if bf.might_contain(&key) {
            hits += 1;
        }
    }
    hits as f64 / total as f64
}

// =============================================================================
// Membership
// =============================================================================
#[test]
fn empty_filter_rejects_everything() {
    let bf = BloomFilter::with_bits_per_key(100, 10);
    for key in [&b""[..], b"a", b"segment", &[0xFF; 32]] {
        assert!(!bf.might_contain(key));
    }
}

#[test]
fn built_filter_never_gives_false_negatives() {
    for bits_per_key in [1, 4, 10, 20] {
        let keys: Vec<Vec<u8>> = (0..5_000u32).map(|i| format!("user:{:08}", i * 7).into_bytes()).collect();
        let mut builder = BloomFilterBuilder::new(bits_per_key);
        for key in &keys {
            builder.add_key(key);
        }
        assert_eq!(builder.len(), keys.len());
        let bf = builder.build();

        for key in &keys {
            assert!(bf.might_contain(key), "false negative at {} bits/key", bits_per_key);
        }
    }
}

#[test]
fn odd_keys_are_members_too() {
    let keys = vec![Vec::new(), vec![0x00, 0x01, 0xFF], vec![b'x'; 64 * 1024]];
    let bf = build(keys.clone(), 10);
    for key in &keys {
        assert!(bf.might_contain(key));
    }
}

#[test]
fn repeated_keys_do_not_inflate_rejections() {
    let bf = build(std::iter::repeat_n(b"same".to_vec(), 50), 10);
    assert!(bf.might_contain(b"same"));
    assert!(false_positive_rate(&bf, (0..1_000).map(|i| format!("other{}", i).into_bytes())) < 0.05);
}

// =============================================================================
// False-positive rate
// =============================================================================
#[test]
fn ten_bits_per_key_is_about_one_percent() {
    let bf = build((0..10_000).map(|i| format!("key_{}", i).into_bytes()), 10);
    let fpr = false_positive_rate(&bf, (10_000..30_000).map(|i| format!("key_{}", i).into_bytes()));
    assert!(fpr < 0.02, "fpr {} over 2%", fpr);
}

#[test]
fn more_bits_means_fewer_false_positives() {
    let keys = || (0..5_000).map(|i| format!("k{:06}", i).into_bytes());
    let probes = || (5_000..25_000).map(|i| format!("k{:06}", i).into_bytes());

    let rates: Vec<f64> = [4, 8, 16]
        .into_iter()
        .map(|bits| false_positive_rate(&build(keys(), bits), probes()))
        .collect();
    assert!(rates[0] > rates[1] && rates[1] > rates[2], "rates {:?}", rates);
    assert!(rates[2] < 0.005);
}

#[test]
fn rate_targeted_constructor_meets_its_target() {
    for target in [0.1, 0.01, 0.001] {
        let mut bf = BloomFilter::new(5_000, target);
        for i in 0..5_000 {
            bf.insert(format!("t{}", i).as_bytes());
        }
        let fpr = false_positive_rate(&bf, (5_000..15_000).map(|i| format!("t{}", i).into_bytes()));
        assert!(fpr < target * 3.0, "target {} got {}", target, fpr);
    }
}

#[test]
fn bits_per_key_sizing() {
    let bf = BloomFilter::with_bits_per_key(1_000, 10);
    assert!(bf.num_bits() >= 10_000);
    // round(10 * ln 2) = 7
    assert_eq!(bf.num_hashes(), 7);
}

// =============================================================================
// Encoding
// =============================================================================
#[test]
fn decoded_filter_answers_identically() {
    let bf = build((0..1_000).map(|i| format!("k{}", i).into_bytes()), 10);

    let decoded = BloomFilter::decode(&bf.encode()).unwrap();
    assert_eq!(decoded, bf);
    for i in 0..2_000 {
        let key = format!("k{}", i);
        assert_eq!(decoded.might_contain(key.as_bytes()), bf.might_contain(key.as_bytes()));
    }
}

#[test]
fn damaged_encoding_rejected() {
    let encoded = BloomFilter::with_bits_per_key(100, 10).encode();
    assert!(BloomFilter::decode(&encoded[..encoded.len() - 1]).unwrap_err().is_corruption());
    assert!(BloomFilter::decode(&encoded[..4]).is_err());

    // Header claims zero probes.
    let mut zero_hashes = encoded.clone();
    zero_hashes[..4].copy_from_slice(&0u32.to_le_bytes());
    assert!(BloomFilter::decode(&zero_hashes).is_err());
}
