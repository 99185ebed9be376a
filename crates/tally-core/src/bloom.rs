//! BIP37-style bloom filter and the Murmur3 hash it is built on.
//!
//! The wallet keeps one filter covering every address hash and watched
//! outpoint it knows about; the chain client uses the serialized form to
//! pre-filter blocks.

use std::cmp;

use bitvec::prelude::*;
use bytes::BufMut;

use crate::encoding::{Reader, put_var_bytes};
use crate::error::{BloomError, EncodingError};

/// Maximum filter size in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// How the remote side should update the filter on matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BloomFlags {
    #[default]
    None = 0,
    All = 1,
    PubkeyOnly = 2,
}

impl BloomFlags {
    fn from_u8(b: u8) -> Result<Self, EncodingError> {
        match b {
            0 => Ok(Self::None),
            1 => Ok(Self::All),
            2 => Ok(Self::PubkeyOnly),
            _ => Err(EncodingError::Invalid(format!("bloom flags {b}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    filter: BitVec<u8, Lsb0>,
    n_hash_funcs: u32,
    n_tweak: u32,
    flags: BloomFlags,
}

impl BloomFilter {
    /// Size a filter for `elements` items at the given false positive rate.
    pub fn new(
        elements: u32,
        false_positive_rate: f64,
        tweak: u32,
        flags: BloomFlags,
    ) -> Result<Self, BloomError> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(BloomError::InvalidRate(false_positive_rate.to_string()));
        }
        let elements = cmp::max(elements, 1);

        let ln2 = std::f64::consts::LN_2;
        let ln2_squared = ln2 * ln2;

        let filter_bits =
            (-1.0 * elements as f64 * false_positive_rate.ln() / ln2_squared).ceil() as usize;
        let filter_bits = cmp::max(8, cmp::min(filter_bits, MAX_BLOOM_FILTER_SIZE * 8));
        let filter_bits = filter_bits.div_ceil(8) * 8;

        let n_hash_funcs = (filter_bits as f64 / elements as f64 * ln2).ceil() as u32;
        let n_hash_funcs = cmp::max(1, cmp::min(n_hash_funcs, MAX_HASH_FUNCS));

        Ok(Self {
            filter: bitvec![u8, Lsb0; 0; filter_bits],
            n_hash_funcs,
            n_tweak: tweak,
            flags,
        })
    }

    /// Same as [`BloomFilter::new`] with a random tweak.
    pub fn with_random_tweak(
        elements: u32,
        false_positive_rate: f64,
        flags: BloomFlags,
    ) -> Result<Self, BloomError> {
        Self::new(elements, false_positive_rate, rand::random(), flags)
    }

    pub fn from_bytes(
        data: Vec<u8>,
        n_hash_funcs: u32,
        n_tweak: u32,
        flags: BloomFlags,
    ) -> Result<Self, BloomError> {
        if data.len() > MAX_BLOOM_FILTER_SIZE {
            return Err(BloomError::FilterTooLarge(data.len()));
        }
        if n_hash_funcs > MAX_HASH_FUNCS {
            return Err(BloomError::TooManyHashFuncs(n_hash_funcs));
        }
        Ok(Self {
            filter: BitVec::from_vec(data),
            n_hash_funcs,
            n_tweak,
            flags,
        })
    }

    fn bit_index(&self, i: u32, data: &[u8]) -> usize {
        let seed = i.wrapping_mul(0xfba4c795).wrapping_add(self.n_tweak);
        (murmur3(data, seed) as usize) % self.filter.len()
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.filter.is_empty() {
            return;
        }
        for i in 0..self.n_hash_funcs {
            let index = self.bit_index(i, data);
            self.filter.set(index, true);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        (0..self.n_hash_funcs).all(|i| self.filter[self.bit_index(i, data)])
    }

    pub fn clear(&mut self) {
        self.filter.fill(false);
    }

    pub fn is_empty(&self) -> bool {
        !self.filter.any()
    }

    pub fn size(&self) -> usize {
        self.filter.len().div_ceil(8)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.filter.as_raw_slice().to_vec()
    }

    pub fn hash_funcs(&self) -> u32 {
        self.n_hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.n_tweak
    }

    pub fn flags(&self) -> BloomFlags {
        self.flags
    }

    /// Wire form: varbytes filter, u32 hash count, u32 tweak, u8 flags.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() + 12);
        put_var_bytes(&mut out, &self.to_bytes());
        out.put_u32_le(self.n_hash_funcs);
        out.put_u32_le(self.n_tweak);
        out.put_u8(self.flags as u8);
        out
    }

    pub fn from_raw(data: &[u8]) -> Result<Self, EncodingError> {
        let mut r = Reader::new(data);
        let bits = r.read_var_bytes()?;
        let n_hash_funcs = r.read_u32()?;
        let n_tweak = r.read_u32()?;
        let flags = BloomFlags::from_u8(r.read_u8()?)?;
        r.finish()?;
        Self::from_bytes(bits, n_hash_funcs, n_tweak, flags)
            .map_err(|e| EncodingError::Invalid(e.to_string()))
    }
}

/// 32-bit Murmur3 as used by BIP37.
pub fn murmur3(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for block in &mut chunks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k1 ^= u32::from(*byte) << (8 * i);
        }
        hash ^= k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn murmur3_vectors() {
        assert_eq!(murmur3(b"", 0), 0);
        assert_eq!(murmur3(b"", 0xfba4c795), 0x6a396f08);
        assert_eq!(murmur3(b"", 0xffffffff), 0x81f16f39);
        assert_eq!(murmur3(&[0x00], 0), 0x514e28b7);
        assert_eq!(murmur3(&[0xff], 0), 0xfd6cf10d);
        assert_eq!(murmur3(&[0x00, 0x11, 0x22, 0x33], 0), 0xb4471bf8);
    }

    #[test]
    fn insert_and_contains() {
        let mut filter = BloomFilter::new(10, 0.001, 0, BloomFlags::None).unwrap();
        filter.insert(b"hello");
        assert!(filter.contains(b"hello"));
        assert!(!filter.contains(b"world"));
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let mut filter = BloomFilter::new(100, 0.01, 5, BloomFlags::All).unwrap();
        for i in 0u32..100 {
            filter.insert(&i.to_le_bytes());
        }
        for i in 0u32..100 {
            assert!(filter.contains(&i.to_le_bytes()));
        }
        let fp = (1000u32..3000)
            .filter(|i| filter.contains(&i.to_le_bytes()))
            .count();
        assert!(fp < 100, "{fp} false positives");
    }

    #[test]
    fn clear_resets_bits() {
        let mut filter = BloomFilter::new(10, 0.001, 0, BloomFlags::None).unwrap();
        filter.insert(b"x");
        filter.clear();
        assert!(filter.is_empty());
        assert!(!filter.contains(b"x"));
    }

    #[test]
    fn raw_roundtrip_keeps_membership() {
        let mut filter = BloomFilter::new(20, 0.0001, 99, BloomFlags::PubkeyOnly).unwrap();
        filter.insert(&[0xAB; 32]);
        let back = BloomFilter::from_raw(&filter.to_raw()).unwrap();
        assert_eq!(back, filter);
        assert!(back.contains(&[0xAB; 32]));
    }

    #[test]
    fn size_limits() {
        let filter = BloomFilter::new(10_000_000, 0.000001, 0, BloomFlags::None).unwrap();
        assert_eq!(filter.size(), MAX_BLOOM_FILTER_SIZE);
        assert!(BloomFilter::new(10, 0.0, 0, BloomFlags::None).is_err());
        assert!(BloomFilter::from_bytes(vec![0; MAX_BLOOM_FILTER_SIZE + 1], 1, 0, BloomFlags::None).is_err());
        assert!(BloomFilter::from_bytes(vec![0; 8], MAX_HASH_FUNCS + 1, 0, BloomFlags::None).is_err());
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn inserted_items_are_always_found(
            items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..50),
            tweak in any::<u32>(),
        ) {
            let mut filter =
                BloomFilter::new(items.len() as u32, 0.001, tweak, BloomFlags::All).unwrap();
            for item in &items {
                filter.insert(item);
            }
            for item in &items {
                prop_assert!(filter.contains(item));
            }
        }
    }
}
