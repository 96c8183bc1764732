//! Hashing utilities for meshkv
//!
//! - 64-bit key identity hash (stable across runs and processes)
//! - 32-bit rendezvous score for replica placement
//! - Two-level on-disk paths derived from the key hash

use std::path::{Path, PathBuf};

/// Maximum key length in bytes
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Maximum value length in bytes (after decompression)
pub const MAX_VALUE_SIZE: usize = 100 * 1024 * 1024;

/// Stable 64-bit identity hash of a key.
///
/// The first 8 bytes of the BLAKE3 digest, little-endian. Used for cache
/// sharding, WAL records and on-disk object names.
pub fn h64(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    u64::from_le_bytes(digest.as_bytes()[0..8].try_into().unwrap())
}

/// Rendezvous placement score of `(key, node)`.
///
/// CRC32 over the byte concatenation `key || node`. Equal input, equal
/// output; no cryptographic requirement.
pub fn placement_score(key: &[u8], node: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(node.as_bytes());
    hasher.finalize()
}

/// 16-character lowercase hex of a key hash
pub fn hash_hex(h: u64) -> String {
    format!("{:016x}", h)
}

/// On-disk path for a key hash: `<root>/<hh>/<hash_hex>`, where `hh` is the
/// first two hex characters. The two-level fanout bounds per-directory size.
pub fn object_path(root: &Path, h: u64) -> PathBuf {
    let hex = hash_hex(h);
    root.join(&hex[0..2]).join(hex)
}
