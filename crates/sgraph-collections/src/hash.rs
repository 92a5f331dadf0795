// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Fixed-seed hashing for the bucket structures.
//!
//! Keys are folded 8 bytes at a time Murmur-style and run through the
//! Murmur3 64-bit finalizer. The seed is fixed so bucket placement is
//! deterministic across runs and across replicas of a map.

use std::hash::{Hash, Hasher};

const SEED: u64 = 0xc6a4_a793_5bd1_e995;
const M: u64 = 0xc6a4_a793_5bd1_e995;

#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

struct MixHasher(u64);

impl Hasher for MixHasher {
    fn write(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
            k = k.wrapping_mul(M).rotate_left(31);
            self.0 = (self.0 ^ k).rotate_left(27).wrapping_mul(M);
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            let mut k = 0u64;
            for (i, b) in rest.iter().enumerate() {
                k |= (*b as u64) << (8 * i);
            }
            self.0 ^= k.wrapping_mul(M).rotate_left(31);
        }
    }

    fn finish(&self) -> u64 {
        fmix64(self.0)
    }
}

/// Hashes a key with the fixed seed.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = MixHasher(SEED);
    key.hash(&mut hasher);
    hasher.finish()
}
