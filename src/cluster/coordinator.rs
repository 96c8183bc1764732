//! Cluster coordinator: quorum writes, fall-through reads with
//! read-repair, quorum deletes
//!
//! A write fans out to the rendezvous-ranked replica set through a bounded
//! worker pool and returns as soon as a quorum of replicas acknowledges.
//! Stragglers keep running; their results are drained and discarded, which
//! is safe because replicated Sets are idempotent.

use crate::cluster::{placement, Client};
use crate::common::{Error, Result};
use crate::storage::StorageEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Duration, Instant};

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(50);
const QUORUM_TIMEOUT: Duration = Duration::from_secs(30);

enum Verb {
    Write(Vec<u8>),
    Delete,
}

pub struct Coordinator {
    self_addr: String,
    nodes: Vec<String>,
    replicas: usize,
    engine: Arc<StorageEngine>,
    client: Arc<Client>,
    workers: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        self_addr: String,
        nodes: Vec<String>,
        replicas: usize,
        workers: usize,
        engine: Arc<StorageEngine>,
        client: Arc<Client>,
    ) -> Self {
        Self {
            self_addr,
            nodes,
            replicas,
            engine,
            client,
            workers: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Quorum write: succeed once `⌊R/2⌋+1` replicas acknowledge.
    pub async fn write(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.quorum(key, Verb::Write(value)).await
    }

    /// Quorum delete, same structure as `write`.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.quorum(key, Verb::Delete).await
    }

    /// Fall-through read in placement order. The first remote hit is
    /// written back to the local engine (read-repair, best effort).
    ///
    /// A replica only falls through to replicas ranked ahead of itself:
    /// every remote hop strictly decreases the rank, so peer-to-peer reads
    /// of a missing key terminate after at most R hops instead of cycling
    /// through the replica set. A node outside the replica set queries the
    /// whole list.
    pub async fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        let replicas = placement::replicas(key, &self.nodes, self.replicas);
        let self_rank = replicas.iter().position(|node| *node == self.self_addr);

        for (rank, node) in replicas.iter().enumerate() {
            match self_rank {
                Some(own) if rank == own => {
                    if let Ok(value) = self.engine.get(key).await {
                        return Ok(value);
                    }
                    continue;
                }
                Some(own) if rank > own => break,
                _ => {}
            }

            match self.client.get(node, key).await {
                Ok(value) => {
                    if let Err(e) = self.engine.set(key, value.clone()).await {
                        tracing::debug!(error = %e, "read-repair set failed");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!(node = %node, error = %e, "replica read miss");
                }
            }
        }

        Err(Error::NotFound)
    }

    async fn quorum(&self, key: &[u8], verb: Verb) -> Result<()> {
        let replicas = placement::replicas(key, &self.nodes, self.replicas);
        if replicas.is_empty() {
            return Err(Error::NoNodes);
        }

        let quorum = replicas.len() / 2 + 1;
        let total = replicas.len();
        let (tx, mut rx) = mpsc::channel::<bool>(total);
        let mut spawned = 0usize;

        for node in replicas {
            // A congested worker pool counts as a replica failure rather
            // than stalling the write.
            let permit = match timeout(ACQUIRE_TIMEOUT, self.workers.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    tracing::warn!(node = %node, "worker pool congested, counting replica as failed");
                    continue;
                }
            };

            spawned += 1;
            let tx = tx.clone();
            let key = key.to_vec();
            let local = node == self.self_addr;
            let engine = self.engine.clone();
            let client = self.client.clone();
            let payload = match &verb {
                Verb::Write(value) => Some(value.clone()),
                Verb::Delete => None,
            };

            tokio::spawn(async move {
                let _permit = permit;
                // Remote deletes ride SYNC as an empty-value tombstone, so a
                // peer applies them locally and never re-fans out.
                let ok = match (local, payload) {
                    (true, Some(value)) => engine.set(&key, value).await.is_ok(),
                    (true, None) => engine.delete(&key).await.is_ok(),
                    (false, Some(value)) => client.sync(&node, &key, &value).await.is_ok(),
                    (false, None) => client.sync(&node, &key, &[]).await.is_ok(),
                };
                if !ok {
                    tracing::debug!(node = %node, "replica operation failed");
                }
                // The caller may be gone after reaching quorum.
                let _ = tx.send(ok).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + QUORUM_TIMEOUT;
        let mut successes = 0usize;
        let mut finished = 0usize;

        while finished < spawned {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ok)) => {
                    finished += 1;
                    if ok {
                        successes += 1;
                        if successes >= quorum {
                            return Ok(());
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => return Err(Error::Timeout("quorum".into())),
            }
        }

        Err(Error::QuorumUnreached { successes, quorum })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn single_node_coordinator(dir: &std::path::Path) -> Coordinator {
        let engine = Arc::new(StorageEngine::open(dir, 64 * 1024 * 1024).await.unwrap());
        Coordinator::new(
            "self:3000".to_string(),
            vec!["self:3000".to_string()],
            3,
            50,
            engine,
            Arc::new(Client::new(String::new())),
        )
    }

    #[tokio::test]
    async fn test_single_node_quorum_is_one() {
        let dir = tempdir().unwrap();
        let coordinator = single_node_coordinator(dir.path()).await;

        coordinator.write(b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(coordinator.read(b"k").await.unwrap(), b"v");

        coordinator.delete(b"k").await.unwrap();
        assert!(matches!(coordinator.read(b"k").await, Err(Error::NotFound)));

        coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_with_no_nodes() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            StorageEngine::open(dir.path(), 64 * 1024 * 1024).await.unwrap(),
        );
        let coordinator = Coordinator::new(
            "self:3000".to_string(),
            vec![],
            3,
            50,
            engine,
            Arc::new(Client::new(String::new())),
        );

        assert!(matches!(
            coordinator.write(b"k", b"v".to_vec()).await,
            Err(Error::NoNodes)
        ));
        coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peers_fail_quorum() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(
            StorageEngine::open(dir.path(), 64 * 1024 * 1024).await.unwrap(),
        );
        // Self plus two peers on a reserved address: only 1/3 can ack.
        let coordinator = Coordinator::new(
            "self:3000".to_string(),
            vec![
                "self:3000".to_string(),
                "192.0.2.1:9".to_string(),
                "192.0.2.2:9".to_string(),
            ],
            3,
            50,
            engine,
            Arc::new(Client::new(String::new())),
        );

        assert!(matches!(
            coordinator.write(b"k", b"v".to_vec()).await,
            Err(Error::QuorumUnreached { successes: 1, quorum: 2 })
        ));

        // The local replica still took the write.
        assert_eq!(coordinator.engine().get(b"k").await.unwrap(), b"v");
        coordinator.engine().close().await.unwrap();
    }
}
