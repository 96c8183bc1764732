//! Sharded in-memory cache with approximate-LFU eviction
//!
//! 256 independent shards keyed by the low bits of the key hash, each a
//! reader/writer-locked map. A bloom filter in front short-circuits misses
//! without touching any shard lock. Per-entry hit counters feed eviction,
//! which drops roughly the least-used quarter of entries whenever the size
//! ceiling is crossed.

use crate::storage::bloom::Bloom;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

const SHARDS: usize = 256;

struct Entry {
    data: Vec<u8>,
    hits: AtomicU32,
}

pub struct Cache {
    shards: Vec<RwLock<HashMap<u64, Entry>>>,
    bloom: Bloom,
    size: AtomicI64,
    items: AtomicI64,
}

impl Cache {
    /// `expected_items` sizes the bloom filter and the initial shard maps.
    pub fn new(expected_items: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARDS);
        shards.resize_with(SHARDS, || {
            RwLock::new(HashMap::with_capacity(expected_items / SHARDS))
        });
        Self {
            shards,
            bloom: Bloom::new(expected_items),
            size: AtomicI64::new(0),
            items: AtomicI64::new(0),
        }
    }

    fn shard(&self, h: u64) -> &RwLock<HashMap<u64, Entry>> {
        &self.shards[(h % SHARDS as u64) as usize]
    }

    /// Insert or overwrite. An overwrite resets the hit counter.
    pub fn set(&self, h: u64, data: Vec<u8>) {
        let mut shard = self.shard(h).write();
        match shard.get_mut(&h) {
            Some(entry) => {
                self.size
                    .fetch_add(data.len() as i64 - entry.data.len() as i64, Ordering::Relaxed);
                entry.data = data;
                entry.hits.store(0, Ordering::Relaxed);
            }
            None => {
                self.size.fetch_add(data.len() as i64, Ordering::Relaxed);
                self.items.fetch_add(1, Ordering::Relaxed);
                self.bloom.add(h);
                shard.insert(
                    h,
                    Entry {
                        data,
                        hits: AtomicU32::new(0),
                    },
                );
            }
        }
    }

    pub fn get(&self, h: u64) -> Option<Vec<u8>> {
        if !self.bloom.has(h) {
            return None;
        }
        let shard = self.shard(h).read();
        let entry = shard.get(&h)?;
        // Saturating: a hot entry pinned at u32::MAX stays there.
        let _ = entry
            .hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |hits| {
                hits.checked_add(1)
            });
        Some(entry.data.clone())
    }

    /// Remove an entry, returning the freed byte count.
    pub fn del(&self, h: u64) -> Option<usize> {
        let mut shard = self.shard(h).write();
        let entry = shard.remove(&h)?;
        self.size.fetch_sub(entry.data.len() as i64, Ordering::Relaxed);
        self.items.fetch_sub(1, Ordering::Relaxed);
        Some(entry.data.len())
    }

    pub fn contains(&self, h: u64) -> bool {
        if !self.bloom.has(h) {
            return false;
        }
        self.shard(h).read().contains_key(&h)
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> i64 {
        self.items.load(Ordering::Relaxed)
    }

    /// Drop roughly a quarter of the entries, lowest observed hits first.
    ///
    /// Scans every shard under its read lock, so concurrent reads of other
    /// keys are never blocked for the duration of the scan.
    pub fn evict(&self, max_bytes: i64) {
        if self.size.load(Ordering::Relaxed) < max_bytes {
            return;
        }

        let target = (self.items.load(Ordering::Relaxed) / 4) as usize;
        if target == 0 {
            return;
        }

        let mut heap: BinaryHeap<Reverse<(u32, u64)>> =
            BinaryHeap::with_capacity(self.items.load(Ordering::Relaxed).max(0) as usize);
        for shard in &self.shards {
            let shard = shard.read();
            for (&h, entry) in shard.iter() {
                heap.push(Reverse((entry.hits.load(Ordering::Relaxed), h)));
            }
        }

        for _ in 0..target {
            match heap.pop() {
                Some(Reverse((_, h))) => {
                    self.del(h);
                }
                None => break,
            }
        }
    }
}
