use crate::error::{Result, SiltError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Probabilistic key-absence test attached to each SSTable.
///
/// False positives are possible, false negatives are not: a negative answer
/// lets the read path skip the file entirely.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the target false-positive
    /// rate: `m = ceil(-n * ln(p) / ln(2)^2)`, `k = max(1, round(m/n * ln 2))`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.999);

        let m = (-n * p.ln() / (2.0_f64.ln().powi(2))).ceil() as u32;
        let num_bits = m.max(8);
        let num_hashes = ((num_bits as f64 / n) * 2.0_f64.ln()).round().max(1.0) as u32;

        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// `[m:u32][k:u32][bits]`, big-endian.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.bits.len());
        buf.put_u32(self.num_bits);
        buf.put_u32(self.num_hashes);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    pub fn deserialize(mut data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(SiltError::Corruption(
                "bloom filter shorter than its header".into(),
            ));
        }
        let num_bits = data.get_u32();
        let num_hashes = data.get_u32();
        let byte_len = num_bits.div_ceil(8) as usize;
        if data.remaining() < byte_len {
            return Err(SiltError::Corruption(format!(
                "bloom filter truncated: {} bits declared, {} bytes present",
                num_bits,
                data.remaining()
            )));
        }
        Ok(Self {
            bits: data[..byte_len].to_vec(),
            num_bits,
            num_hashes,
        })
    }

    pub fn serialized_len(&self) -> usize {
        8 + self.bits.len()
    }

    /// Double hashing: `h_i = (h1 + i * h2) mod m`.
    fn bit_index(&self, h1: u32, h2: u32, i: u32) -> u32 {
        h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits
    }

    fn hash_pair(key: &[u8]) -> (u32, u32) {
        (fnv1a(key), djb2(key))
    }
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn djb2(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in data {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}
