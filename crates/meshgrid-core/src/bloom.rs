//! Attenuated Bloom filter for multi-hop discovery
//!
//! Four 64-bit levels. Level N holds the v1 hashes of nodes N hops away
//! (level 0 = direct neighbors). Each node inserts 2 bits per hash, taken
//! from two 6-bit slices of the 16-bit v1 hash.
//!
//! ```text
//! received beacon:  [L0 | L1 | L2 | L3]
//! attenuate(self):  [self | L0 | L1 | L2]    (L3 falls off)
//! ```
//!
//! Wire form is 32 bytes: four little-endian u64 levels.

use serde::{Deserialize, Serialize};

pub const BLOOM_LEVELS: usize = 4;
pub const BLOOM_BITS: usize = 64;
/// Serialized size
pub const BLOOM_SIZE: usize = BLOOM_LEVELS * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BloomFilter {
    levels: [u64; BLOOM_LEVELS],
}

fn bit_positions(hash: u16) -> (u32, u32) {
    ((hash & 0x3F) as u32, ((hash >> 6) & 0x3F) as u32)
}

impl BloomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `hash` at `level`; out-of-range levels are ignored
    pub fn add(&mut self, level: usize, hash: u16) {
        if let Some(bits) = self.levels.get_mut(level) {
            let (h1, h2) = bit_positions(hash);
            *bits |= (1u64 << h1) | (1u64 << h2);
        }
    }

    /// Nearest level that may contain `hash`
    pub fn check(&self, hash: u16) -> Option<usize> {
        let (h1, h2) = bit_positions(hash);
        let mask = (1u64 << h1) | (1u64 << h2);
        self.levels.iter().position(|bits| bits & mask == mask)
    }

    /// Shift every level one hop outward and reseed level 0 with ourselves
    pub fn attenuate(&mut self, our_hash: u16) {
        for level in (1..BLOOM_LEVELS).rev() {
            self.levels[level] = self.levels[level - 1];
        }
        self.levels[0] = 0;
        self.add(0, our_hash);
    }

    /// Level-wise union
    pub fn merge(&mut self, other: &BloomFilter) {
        for (mine, theirs) in self.levels.iter_mut().zip(other.levels.iter()) {
            *mine |= theirs;
        }
    }

    /// Estimated number of distinct hashes at `level`
    ///
    /// Uses the standard fill-ratio estimate `-(m/k) ln(1 - X/m)` with
    /// m = 64 bits and k = 2 bits per entry.
    pub fn count_level(&self, level: usize) -> u8 {
        let Some(bits) = self.levels.get(level) else {
            return 0;
        };
        let set = bits.count_ones() as usize;
        if set == 0 {
            return 0;
        }
        if set >= BLOOM_BITS {
            return u8::MAX;
        }
        let m = BLOOM_BITS as f64;
        let estimate = -(m / 2.0) * (1.0 - set as f64 / m).ln();
        estimate.clamp(0.0, u8::MAX as f64) as u8
    }

    pub fn count_total(&self) -> u16 {
        (0..BLOOM_LEVELS).map(|l| self.count_level(l) as u16).sum()
    }

    pub fn level(&self, level: usize) -> u64 {
        self.levels.get(level).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|&bits| bits == 0)
    }

    pub fn clear(&mut self) {
        self.levels = [0; BLOOM_LEVELS];
    }

    pub fn encode(&self) -> [u8; BLOOM_SIZE] {
        let mut out = [0u8; BLOOM_SIZE];
        for (chunk, bits) in out.chunks_exact_mut(8).zip(self.levels.iter()) {
            chunk.copy_from_slice(&bits.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8; BLOOM_SIZE]) -> Self {
        let mut levels = [0u64; BLOOM_LEVELS];
        for (bits, chunk) in levels.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *bits = u64::from_le_bytes(word);
        }
        Self { levels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_check() {
        let mut bloom = BloomFilter::new();
        assert!(bloom.is_empty());
        assert_eq!(bloom.check(0x1234), None);

        bloom.add(2, 0x1234);
        assert_eq!(bloom.check(0x1234), Some(2));
        assert!(!bloom.is_empty());

        bloom.add(0, 0x1234);
        assert_eq!(bloom.check(0x1234), Some(0));

        // Ignored
        bloom.add(4, 0xFFFF);
        assert_eq!(bloom.level(4), 0);
    }

    #[test]
    fn test_bit_layout() {
        let mut bloom = BloomFilter::new();
        // h1 = 0x05, h2 = (0x0145 >> 6) & 0x3F = 5
        bloom.add(0, 0x0145);
        assert_eq!(bloom.level(0), 1u64 << 5);

        let bytes = bloom.encode();
        assert_eq!(bytes[0], 0x20);
        assert_eq!(BloomFilter::decode(&bytes), bloom);
    }

    #[test]
    fn test_attenuate() {
        let mut bloom = BloomFilter::new();
        bloom.add(0, 0x0001);
        bloom.add(3, 0x0ABC);
        bloom.attenuate(0x0777);

        assert_eq!(bloom.check(0x0777), Some(0));
        assert_eq!(bloom.check(0x0001), Some(1));
        // level 3 shifted out
        assert_eq!(bloom.level(3), 0);
        assert_eq!(bloom.check(0x0ABC), None);
    }

    #[test]
    fn test_merge_monotonic() {
        let mut a = BloomFilter::new();
        a.add(0, 0x1111);
        a.add(1, 0x2222);
        let mut b = BloomFilter::new();
        b.add(1, 0x3333);
        b.add(3, 0x4444);

        let before = a;
        a.merge(&b);
        for level in 0..BLOOM_LEVELS {
            assert_eq!(a.level(level) & before.level(level), before.level(level));
            assert_eq!(a.level(level) & b.level(level), b.level(level));
        }
        assert!(a.count_total() >= before.count_total());
    }

    #[test]
    fn test_count() {
        let mut bloom = BloomFilter::new();
        assert_eq!(bloom.count_level(0), 0);

        bloom.add(0, 0x0001 | (0x02 << 6));
        // 2 bits set: -32 ln(1 - 2/64) = 1.016
        assert_eq!(bloom.count_level(0), 1);

        let full = BloomFilter::decode(&[0xFF; BLOOM_SIZE]);
        assert_eq!(full.count_level(0), 255);
        assert_eq!(full.count_total(), 4 * 255);
        assert_eq!(full.count_level(9), 0);
    }
}
