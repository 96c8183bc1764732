//! Configuration for a meshkv node

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_replicas() -> usize {
    3
}
fn default_workers() -> usize {
    50
}
fn default_cache_mb() -> u64 {
    512
}

/// Which operations require a prior AUTH on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// All operations allowed without authentication
    None,
    /// SET, DELETE and SYNC require authentication
    Writes,
    /// Everything except HEALTH and AUTH requires authentication
    All,
}

impl std::str::FromStr for AuthMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "none" => Ok(AuthMode::None),
            "writes" => Ok(AuthMode::Writes),
            "all" => Ok(AuthMode::All),
            other => Err(crate::Error::InvalidConfig(format!(
                "invalid authmode: {} (use: none, writes, all)",
                other
            ))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Public address of this node (`host:port`), used as its cluster identity
    pub public_addr: String,

    /// TCP port to listen on
    pub port: u16,

    /// Data directory (WAL and value files)
    pub data_dir: PathBuf,

    /// Shared secret for AUTH; empty disables authentication
    #[serde(default)]
    pub auth_key: String,

    /// Auth policy applied per connection
    pub auth_mode: AuthMode,

    /// Requests per second admitted per node; 0 disables rate limiting
    #[serde(default)]
    pub rate_limit: u64,

    /// Cache size ceiling in bytes
    pub max_cache_bytes: u64,

    /// Replication worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Replica count per key
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Static peer list (`host:port` each), excluding or including self
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Config {
    /// All cluster members: the static peer list plus self, deduplicated,
    /// in stable order.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.public_addr.clone()];
        for peer in &self.peers {
            let peer = peer.trim();
            if !peer.is_empty() && !nodes.iter().any(|n| n == peer) {
                nodes.push(peer.to_string());
            }
        }
        nodes
    }

    /// Parse a comma-separated peer list, e.g. from `CLUSTER_NODES`.
    pub fn parse_peers(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.public_addr.is_empty() {
            return Err(crate::Error::InvalidConfig("public_addr is required".into()));
        }

        if self.auth_mode != AuthMode::None && self.auth_key.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "auth key required when authmode is not 'none'".into(),
            ));
        }

        if self.replicas == 0 {
            return Err(crate::Error::InvalidConfig("replicas must be >= 1".into()));
        }

        if self.workers == 0 {
            return Err(crate::Error::InvalidConfig("workers must be >= 1".into()));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_addr: "localhost:3000".to_string(),
            port: 3000,
            data_dir: PathBuf::from("./data"),
            auth_key: String::new(),
            auth_mode: AuthMode::None,
            rate_limit: 0,
            max_cache_bytes: default_cache_mb() * 1024 * 1024,
            workers: default_workers(),
            replicas: default_replicas(),
            peers: vec![],
        }
    }
}
