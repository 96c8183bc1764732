//! # meshkv
//!
//! A distributed, eventually-consistent key-value store with:
//! - Rendezvous (HRW) hashing for deterministic replica placement
//! - Quorum writes and fall-through reads with read-repair
//! - Sharded in-memory cache with approximate-LFU eviction
//! - Batched write-ahead log with crash-safe compaction
//! - Compact binary TCP protocol with auth and rate limiting
//!
//! ## Architecture
//!
//! ```text
//!          ┌───────────────┐   SYNC    ┌───────────────┐
//!          │    Node A     │──────────▶│    Node B     │
//!          │ cache+WAL+dir │◀──────────│ cache+WAL+dir │
//!          └───────┬───────┘           └───────────────┘
//!                  │ SYNC
//!          ┌───────▼───────┐
//!          │    Node C     │   every node is a peer; a write lands on
//!          │ cache+WAL+dir │   the rendezvous-ranked replicas and
//!          └───────────────┘   succeeds once a quorum acknowledges
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! CLUSTER_NODES=10.0.0.2:3000,10.0.0.3:3000 meshkv \
//!   --port 3000 \
//!   --public-url 10.0.0.1:3000 \
//!   --data ./data \
//!   --cache 512
//! ```
//!
//! ### Use the CLI
//! ```bash
//! meshkv-cli --addr localhost:3000 set my-key --file ./data.bin
//! meshkv-cli --addr localhost:3000 get my-key
//! meshkv-cli --addr localhost:3000 del my-key
//! meshkv-cli --addr localhost:3000 health
//! ```

pub mod cluster;
pub mod common;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use cluster::Coordinator;
pub use common::{Config, Error, Result};
pub use server::Server;
pub use storage::StorageEngine;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
