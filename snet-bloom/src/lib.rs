//! Space-efficient probabilistic set membership over byte strings.
//!
//! Grounded in `original_source/bloomfilter/{bitarray,bloomfilter}.go`:
//! an FNV-1a based bloom filter over a [`Bitset`], sized from a target
//! capacity and false-positive rate.

mod bitset;

pub use bitset::{Bitset, BitsetError};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BloomFilterError {
    #[error("bloom filter capacity must be greater than zero")]
    InvalidCapacity,
    #[error("bloom filter error rate {0} must be in (0, 1)")]
    InvalidErrorRate(String),
}

/// A Bloom filter over byte-string items.
///
/// Sizing follows `m ≈ n·|log₂p|/ln2` (rounded up to a multiple of 8) and
/// `k = ⌈log₂(1/p)⌉`, matching the reference implementation. Hashing uses
/// FNV-1a 32-bit with a single-byte probe index **prepended** to the item
/// before hashing — appending would leave a shared prefix across probes,
/// which collapses FNV-1a's effective output range and inflates the
/// false-positive rate.
pub struct BloomFilter {
    k: u8,
    m: u32,
    bits: Bitset,
}

impl BloomFilter {
    pub fn new(capacity: usize, error_rate: f64) -> Result<Self, BloomFilterError> {
        if capacity == 0 {
            return Err(BloomFilterError::InvalidCapacity);
        }
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(BloomFilterError::InvalidErrorRate(error_rate.to_string()));
        }

        let k = (1.0_f64 / error_rate).log2().ceil() as u8;

        let raw_m = (capacity as f64 * error_rate.log2().abs() / std::f64::consts::LN_2).ceil();
        let raw_m = raw_m as u64;
        let m = (raw_m.div_ceil(8) * 8) as u32;

        let bits = Bitset::new(m as usize).map_err(|_| BloomFilterError::InvalidCapacity)?;

        Ok(Self { k, m, bits })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.size_bytes()
    }

    pub fn add(&mut self, item: &[u8]) {
        for probe in 0..self.k {
            let loc = Self::hash(item, probe) % self.m;
            self.bits.set(loc as usize);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.k).all(|probe| {
            let loc = Self::hash(item, probe) % self.m;
            self.bits.test(loc as usize)
        })
    }

    pub fn fill_ratio(&self) -> f64 {
        f64::from(self.bits.popcount()) / f64::from(self.m)
    }

    /// FNV-1a 32-bit over `[seed] ++ item`.
    ///
    /// The seed is prepended, not appended — see module docs.
    fn hash(item: &[u8], seed: u8) -> u32 {
        const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
        const FNV_PRIME: u32 = 0x0100_0193;

        let mut h = FNV_OFFSET_BASIS;

        h ^= u32::from(seed);
        h = h.wrapping_mul(FNV_PRIME);

        for &byte in item {
            h ^= u32::from(byte);
            h = h.wrapping_mul(FNV_PRIME);
        }

        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_params() {
        assert_eq!(BloomFilter::new(0, 0.01), Err(BloomFilterError::InvalidCapacity));
        assert!(BloomFilter::new(100, 0.0).is_err());
        assert!(BloomFilter::new(100, 1.0).is_err());
    }

    #[test]
    fn sizing_matches_reference_numbers() {
        let bf = BloomFilter::new(40_000, 1e-5).unwrap();

        assert_eq!(bf.k(), 17);
        assert_eq!(bf.m(), 958_512);
    }

    #[test]
    fn add_implies_contains() {
        let mut bf = BloomFilter::new(400, 0.001).unwrap();

        let items: Vec<Vec<u8>> = (0..400u32).map(|i| i.to_le_bytes().to_vec()).collect();

        for item in &items {
            bf.add(item);
        }

        for item in &items {
            assert!(bf.contains(item));
        }
    }

    #[test]
    fn empirical_false_positive_rate_is_reasonable() {
        let mut bf = BloomFilter::new(400, 0.001).unwrap();

        for i in 0..400u32 {
            bf.add(&i.to_le_bytes());
        }

        let false_positives = (400_000u32..440_000u32)
            .filter(|i| bf.contains(&i.to_le_bytes()))
            .count();

        // 40,000 samples known not to be members; allow headroom over the
        // nominal 0.1% target so the test isn't flaky.
        assert!(
            (false_positives as f64 / 40_000.0) < 0.01,
            "false positive rate too high: {false_positives}/40000"
        );
    }

    #[test]
    fn prepending_seed_beats_appending() {
        // Appending a seed byte shares a prefix across all probes, which
        // for FNV-1a collapses the hash outputs into a narrow range. This
        // test pins the behavior we must NOT regress to.
        let mut bf = BloomFilter::new(50, 0.01).unwrap();
        bf.add(b"example.com");

        assert!(bf.contains(b"example.com"));
        assert!(!bf.contains(b"definitely-not-added.test"));
    }
}
