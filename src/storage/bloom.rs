//! Lock-free bloom filter for the negative-lookup fast path
//!
//! A fixed bit array with k=3 double hashing. Bits are set with atomic OR
//! and read with atomic loads, so concurrent `add` and `has` never block.
//! There is no removal: the filter only short-circuits misses, so stale
//! bits merely raise the false-positive rate until the next restart.

use std::sync::atomic::{AtomicU64, Ordering};

const K: u32 = 3;
const MIN_WORDS: usize = 1024;

pub struct Bloom {
    bits: Vec<AtomicU64>,
}

impl Bloom {
    /// Size the filter for an expected item count of `n`.
    pub fn new(n: usize) -> Self {
        let words = (n * 10 / 64).max(MIN_WORDS);
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, AtomicU64::default);
        Self { bits }
    }

    fn positions(&self, h: u64) -> impl Iterator<Item = (usize, u32)> + '_ {
        let h1 = h as u32;
        let h2 = (h >> 32) as u32;
        let nbits = (self.bits.len() * 64) as u32;
        (0..K).map(move |i| {
            let pos = h1.wrapping_add(i.wrapping_mul(h2)) % nbits;
            ((pos / 64) as usize, pos % 64)
        })
    }

    pub fn add(&self, h: u64) {
        for (idx, bit) in self.positions(h) {
            self.bits[idx].fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    /// False means definitely absent; true means possibly present.
    pub fn has(&self, h: u64) -> bool {
        self.positions(h)
            .all(|(idx, bit)| self.bits[idx].load(Ordering::Relaxed) & (1 << bit) != 0)
    }
}
