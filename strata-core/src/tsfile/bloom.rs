//! Bloom filter over the series paths of a file

use super::{ensure, get_i32};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut};

/// Bloom filter with double hashing; hashes are stable across builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a filter sized for `num_keys` keys at `error_rate` false positives
    pub fn with_error_rate(num_keys: usize, error_rate: f64) -> Self {
        let n = num_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * error_rate.ln() / (ln2 * ln2)).ceil().max(8.0) as usize;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 30.0) as usize;
        let num_bytes = (num_bits + 7) / 8;

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &str) {
        let (h1, h2) = Self::hash_key(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_key(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_position(h1, h2, i);
            (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
        })
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.bits.len() as i32);
        buf.put_slice(&self.bits);
        buf.put_i32(self.num_hashes as i32);
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let len = get_i32(buf)?;
        if len <= 0 {
            return Err(StrataError::Corruption(format!(
                "Invalid bloom filter size {}",
                len
            )));
        }
        ensure(buf, len as usize)?;
        let mut bits = vec![0u8; len as usize];
        buf.copy_to_slice(&mut bits);
        let num_hashes = get_i32(buf)?;
        if !(1..=30).contains(&num_hashes) {
            return Err(StrataError::Corruption(format!(
                "Invalid bloom filter hash count {}",
                num_hashes
            )));
        }
        Ok(Self {
            num_bits: bits.len() * 8,
            bits,
            num_hashes: num_hashes as usize,
        })
    }

    fn hash_key(key: &str) -> (u64, u64) {
        let h1 = crc32fast::hash(key.as_bytes()) as u64;
        // splitmix64 finalizer spreads the 32-bit crc over the hash step
        let mut z = (h1 ^ ((key.len() as u64) << 32)).wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        let h2 = (z ^ (z >> 31)) | 1;
        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let mut filter = BloomFilter::with_error_rate(100, 0.01);
        for i in 0..100 {
            filter.add(&format!("root.sg.d{}.s0", i));
        }

        for i in 0..100 {
            assert!(filter.may_contain(&format!("root.sg.d{}.s0", i)));
        }

        let false_positives = (100..1000)
            .filter(|i| filter.may_contain(&format!("root.sg.d{}.s0", i)))
            .count();
        let fp_rate = false_positives as f64 / 900.0;
        assert!(fp_rate < 0.05, "False positive rate too high: {}", fp_rate);
    }

    #[test]
    fn test_bloom_filter_serialization() {
        let mut filter = BloomFilter::with_error_rate(50, 0.05);
        for i in 0..50 {
            filter.add(&i.to_string());
        }

        let mut buf = Vec::new();
        filter.serialize(&mut buf);
        let restored = BloomFilter::deserialize(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, filter);
        for i in 0..50 {
            assert!(restored.may_contain(&i.to_string()));
        }
    }
}
