// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

// Second base hash gets its own seed so the two probes are independent
const H2_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// A standard bloom filter
///
/// Used as an admission check before consulting the hash index or an
/// SSTable. Instead of `k` independent hash functions, probe `i` touches
/// bit `h1 + i·h2 mod m`, derived from two base hashes of the key.
///
/// Guarantees no false negatives for keys added since the last rebuild.
#[derive(Debug, Eq, PartialEq)]
pub struct BloomFilter {
    /// Bit array, packed into 64-bit words
    words: Vec<u64>,

    /// Bit count `m` (a multiple of 64)
    bit_count: usize,

    /// Probes per key `k`
    hash_count: usize,
}

impl BloomFilter {
    /// Constructs a bloom filter with (at least) `bits` bits and `hashes`
    /// probes per key.
    #[must_use]
    pub fn with_size(bits: usize, hashes: usize) -> Self {
        let words = vec![0u64; bits.max(64).div_ceil(64)];
        let bit_count = words.len() * 64;

        Self {
            words,
            bit_count,
            hash_count: hashes.max(1),
        }
    }

    /// Constructs a bloom filter sized for `n` keys at a target false
    /// positive rate.
    ///
    /// Solves `m = -n·ln(p) / ln(2)²` and `k = (m/n)·ln(2)`; the achieved
    /// rate is approximately `(1 - e^(-kn/m))^k`.
    #[must_use]
    pub fn with_fp_rate(n: usize, fp_rate: f64) -> Self {
        use std::f64::consts::LN_2;

        assert!(n > 0);

        let p = fp_rate.clamp(1e-7, 0.5);

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bits = (-(n as f64) * p.ln() / (LN_2 * LN_2)).ceil() as usize;

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let hashes = ((bits as f64 / n as f64) * LN_2).round() as usize;

        Self::with_size(bits, hashes)
    }

    /// Bit count `m`.
    #[must_use]
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Probes per lookup `k`.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    /// Two base hashes all probe positions derive from.
    fn hash_pair(key: &[u8]) -> (u64, u64) {
        // h2 is forced odd so consecutive probes never collapse onto one bit
        (xxh3_64(key), xxh3_64_with_seed(key, H2_SEED) | 1)
    }

    /// Adds the key to the filter.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        let m = self.bit_count as u64;

        for i in 0..self.hash_count as u64 {
            #[allow(clippy::cast_possible_truncation)]
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize;

            if let Some(word) = self.words.get_mut(bit / 64) {
                *word |= 1 << (bit % 64);
            }
        }
    }

    /// Returns `true` if the key may have been added.
    ///
    /// Never returns `false` for a key that was added.
    #[must_use]
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        let m = self.bit_count as u64;

        (0..self.hash_count as u64).all(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize;

            self.words
                .get(bit / 64)
                .is_some_and(|word| ((*word >> (bit % 64)) & 1) == 1)
        })
    }

    /// Clears the filter and re-adds the given keys.
    ///
    /// Anything not re-added stops matching (up to residual false
    /// positives from the surviving keys).
    pub fn rebuild<I: IntoIterator<Item = K>, K: AsRef<[u8]>>(&mut self, keys: I) {
        self.words.fill(0);

        for key in keys {
            self.add(key.as_ref());
        }
    }
}
