//! Common utilities and types shared across meshkv

pub mod compress;
pub mod config;
pub mod error;
pub mod hash;

pub use compress::{compress, decompress};
pub use config::{AuthMode, Config};
pub use error::{Error, Result};
pub use hash::{h64, hash_hex, object_path, placement_score, MAX_KEY_SIZE, MAX_VALUE_SIZE};
