//! Error types for meshkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("key not found")]
    NotFound,

    #[error("value too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("WAL error: {0}")]
    Wal(String),

    // === Cluster Errors ===
    #[error("no nodes available")]
    NoNodes,

    #[error("quorum not reached: {successes}/{quorum}")]
    QuorumUnreached { successes: usize, quorum: usize },

    #[error("operation timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // === Protocol Errors ===
    #[error("authentication failed")]
    AuthFailed,

    #[error("peer returned error status")]
    PeerError,

    #[error("rate limited")]
    RateLimited,

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::QuorumUnreached { .. }
                | Error::RateLimited
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
