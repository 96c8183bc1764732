//! Single-node storage engine: sharded cache, bloom filter, WAL and the
//! two-level on-disk value directory.

pub mod bloom;
pub mod cache;
pub mod engine;
pub mod wal;

pub use bloom::Bloom;
pub use cache::Cache;
pub use engine::StorageEngine;
pub use wal::Wal;
