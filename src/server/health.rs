//! Health snapshot
//!
//! Collects runtime and storage counters into a JSON object. The field
//! names are a stable wire contract; clients parse them.

use crate::storage::StorageEngine;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;
use sysinfo::{Pid, System};

const MB: i64 = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub cache_items: i64,
    pub cache_size_mb: i64,
    pub storage_size_mb: i64,
    pub memory_mb: u64,
    pub tasks: usize,
}

pub struct HealthCollector {
    started: Instant,
    pid: Pid,
    system: Mutex<System>,
}

impl HealthCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
        }
    }

    /// Snapshot current counters. `tasks` is the number of live connection
    /// handlers.
    pub fn snapshot(&self, engine: &StorageEngine, tasks: usize) -> Health {
        let memory_mb = {
            let mut system = self.system.lock();
            system.refresh_process(self.pid);
            system
                .process(self.pid)
                .map(|p| p.memory() / MB as u64)
                .unwrap_or(0)
        };

        Health {
            status: "healthy",
            uptime_seconds: self.started.elapsed().as_secs(),
            cache_items: engine.cache_items(),
            cache_size_mb: engine.cache_size() / MB,
            storage_size_mb: engine.disk_size() / MB,
            memory_mb,
            tasks,
        }
    }
}

impl Default for HealthCollector {
    fn default() -> Self {
        Self::new()
    }
}
