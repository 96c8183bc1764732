//! Connection server
//!
//! Accept loop plus a per-connection handler task. Admission is guarded by
//! a connection semaphore (connections over the cap are dropped at accept
//! time) and an optional token-bucket rate limiter (denied requests get an
//! error status but keep their connection). Authentication state lives in
//! the handler, never shared across connections.

pub mod health;
pub mod ratelimit;

use crate::cluster::Coordinator;
use crate::common::{decompress, AuthMode, Config, Error, Result, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::protocol::{
    discard_value, read_key, read_request_header, read_value, read_value_header, write_err,
    write_ok, write_response, OP_AUTH, OP_DELETE, OP_GET, OP_HEALTH, OP_SET, OP_SYNC, STATUS_OK,
};
use health::HealthCollector;
use ratelimit::RateLimiter;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

const MAX_CONNECTIONS: usize = 50_000;

pub struct Server {
    coordinator: Arc<Coordinator>,
    auth_key: String,
    auth_mode: AuthMode,
    limiter: Option<RateLimiter>,
    connections: Arc<Semaphore>,
    health: HealthCollector,
}

impl Server {
    pub fn new(config: &Config, coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            auth_key: config.auth_key.clone(),
            auth_mode: config.auth_mode,
            limiter: (config.rate_limit > 0).then(|| RateLimiter::new(config.rate_limit)),
            connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            health: HealthCollector::new(),
        }
    }

    /// Accept loop. Runs until the listener is torn down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let permit = match self.connections.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(peer = %peer, "connection limit reached, dropping");
                    continue;
                }
            };

            let _ = stream.set_nodelay(true);

            let server = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle(stream).await {
                    tracing::debug!(peer = %peer, error = %e, "connection closed");
                }
            });
        }
    }

    fn needs_auth(&self, op: u8) -> bool {
        match self.auth_mode {
            AuthMode::None => false,
            AuthMode::Writes => matches!(op, OP_SET | OP_DELETE | OP_SYNC),
            AuthMode::All => !matches!(op, OP_HEALTH | OP_AUTH),
        }
    }

    /// Per-connection request loop. Returning (with or without an error)
    /// closes the connection.
    async fn handle<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut authenticated = self.auth_mode == AuthMode::None;
        let mut key_buf: Vec<u8> = Vec::with_capacity(1024);
        let mut val_buf: Vec<u8> = Vec::with_capacity(16 * 1024);

        loop {
            let header = match read_request_header(&mut stream).await? {
                Some(header) => header,
                None => return Ok(()),
            };

            if header.key_len > MAX_KEY_SIZE {
                write_err(&mut stream).await?;
                return Err(Error::Corrupted("oversized key".into()));
            }
            read_key(&mut stream, header.key_len, &mut key_buf).await?;

            let denied = self.needs_auth(header.op) && !authenticated;

            // SET and SYNC carry a payload which must be consumed even on
            // the error paths to keep the stream framed.
            let mut value: Option<Vec<u8>> = None;
            if matches!(header.op, OP_SET | OP_SYNC) {
                let value_header = read_value_header(&mut stream).await?;

                if value_header.len > MAX_VALUE_SIZE {
                    discard_value(&mut stream, value_header.len).await?;
                    write_err(&mut stream).await?;
                    if denied {
                        return Ok(());
                    }
                    continue;
                }

                if denied {
                    discard_value(&mut stream, value_header.len).await?;
                    write_err(&mut stream).await?;
                    return Ok(());
                }

                read_value(&mut stream, value_header.len, &mut val_buf).await?;

                match decompress(&val_buf, value_header.compressed, MAX_VALUE_SIZE) {
                    Ok(data) if data.len() <= MAX_VALUE_SIZE => value = Some(data),
                    _ => {
                        write_err(&mut stream).await?;
                        continue;
                    }
                }
            } else if denied {
                write_err(&mut stream).await?;
                return Ok(());
            }

            if let Some(limiter) = &self.limiter {
                if !limiter.allow() {
                    write_err(&mut stream).await?;
                    continue;
                }
            }

            match header.op {
                OP_AUTH => {
                    if !self.auth_key.is_empty() && key_buf == self.auth_key.as_bytes() {
                        authenticated = true;
                        write_ok(&mut stream).await?;
                    } else {
                        write_err(&mut stream).await?;
                    }
                }

                OP_GET => match self.coordinator.read(&key_buf).await {
                    Ok(data) => write_response(&mut stream, STATUS_OK, &data).await?,
                    Err(_) => write_err(&mut stream).await?,
                },

                OP_SET => {
                    let value = value.take().unwrap_or_default();
                    match self.coordinator.write(&key_buf, value).await {
                        Ok(()) => write_ok(&mut stream).await?,
                        Err(e) => {
                            tracing::debug!(error = %e, "set failed");
                            write_err(&mut stream).await?;
                        }
                    }
                }

                OP_DELETE => match self.coordinator.delete(&key_buf).await {
                    Ok(()) => write_ok(&mut stream).await?,
                    Err(e) => {
                        tracing::debug!(error = %e, "delete failed");
                        write_err(&mut stream).await?;
                    }
                },

                OP_SYNC => {
                    let value = value.take().unwrap_or_default();
                    match self.coordinator.engine().set(&key_buf, value).await {
                        Ok(()) => write_ok(&mut stream).await?,
                        Err(e) => {
                            tracing::debug!(error = %e, "sync failed");
                            write_err(&mut stream).await?;
                        }
                    }
                }

                OP_HEALTH => {
                    let tasks = MAX_CONNECTIONS - self.connections.available_permits();
                    let health = self.health.snapshot(self.coordinator.engine(), tasks);
                    let json = serde_json::to_vec(&health)
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    write_response(&mut stream, STATUS_OK, &json).await?;
                }

                op => {
                    write_err(&mut stream).await?;
                    return Err(Error::Corrupted(format!("unknown opcode {:#04x}", op)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Client;
    use crate::protocol::{encode_key_request, encode_value_request, read_response, STATUS_ERR};
    use crate::storage::StorageEngine;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    async fn test_server(dir: &std::path::Path, config: Config) -> Arc<Server> {
        let engine = Arc::new(StorageEngine::open(dir, 64 * 1024 * 1024).await.unwrap());
        let coordinator = Arc::new(Coordinator::new(
            config.public_addr.clone(),
            config.nodes(),
            config.replicas,
            config.workers,
            engine,
            Arc::new(Client::new(config.auth_key.clone())),
        ));
        Arc::new(Server::new(&config, coordinator))
    }

    #[tokio::test]
    async fn test_set_get_delete_over_stream() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path(), Config::default()).await;

        let (mut client, stream) = tokio::io::duplex(1024 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        client
            .write_all(&encode_value_request(OP_SET, b"greeting", b"hello", false))
            .await
            .unwrap();
        let (status, payload) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!((status, payload.len()), (STATUS_OK, 0));

        client
            .write_all(&encode_key_request(OP_GET, b"greeting"))
            .await
            .unwrap();
        let (status, payload) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);
        assert_eq!(payload, b"hello");

        client
            .write_all(&encode_key_request(OP_DELETE, b"greeting"))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);

        client
            .write_all(&encode_key_request(OP_GET, b"greeting"))
            .await
            .unwrap();
        let (status, payload) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!((status, payload.len()), (STATUS_ERR, 0));

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthenticated_write_closes_connection() {
        let dir = tempdir().unwrap();
        let config = Config {
            auth_key: "secret".to_string(),
            auth_mode: AuthMode::Writes,
            ..Default::default()
        };
        let server = test_server(dir.path(), config).await;

        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        client
            .write_all(&encode_value_request(OP_SET, b"k", b"v", false))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_ERR);

        // Handler exits: the connection was closed on the auth violation.
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_then_write_succeeds() {
        let dir = tempdir().unwrap();
        let config = Config {
            auth_key: "secret".to_string(),
            auth_mode: AuthMode::Writes,
            ..Default::default()
        };
        let server = test_server(dir.path(), config).await;

        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        // Wrong secret leaves the connection open in the same state.
        client
            .write_all(&encode_key_request(OP_AUTH, b"wrong"))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_ERR);

        client
            .write_all(&encode_key_request(OP_AUTH, b"secret"))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);

        client
            .write_all(&encode_value_request(OP_SET, b"k", b"v", false))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);

        // Reads never require auth in `writes` mode.
        client.write_all(&encode_key_request(OP_GET, b"k")).await.unwrap();
        let (status, payload) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);
        assert_eq!(payload, b"v");

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_disabled_rejects_auth_op() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path(), Config::default()).await;

        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        client
            .write_all(&encode_key_request(OP_AUTH, b"anything"))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_ERR);

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compressed_set_roundtrip() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path(), Config::default()).await;

        let (mut client, stream) = tokio::io::duplex(1024 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        let value = vec![7u8; 32 * 1024];
        let (payload, compressed) = crate::common::compress(&value);
        assert!(compressed);

        client
            .write_all(&encode_value_request(OP_SET, b"blob", &payload, compressed))
            .await
            .unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);

        client.write_all(&encode_key_request(OP_GET, b"blob")).await.unwrap();
        let (status, fetched) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);
        assert_eq!(fetched, value);

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_payload() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path(), Config::default()).await;

        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        client.write_all(&encode_key_request(OP_HEALTH, b"")).await.unwrap();
        let (status, payload) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_OK);

        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["cache_items"].is_number());

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_denial_keeps_connection() {
        let dir = tempdir().unwrap();
        let config = Config {
            rate_limit: 2,
            ..Default::default()
        };
        let server = test_server(dir.path(), config).await;

        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let handler = {
            let server = server.clone();
            tokio::spawn(async move { server.handle(stream).await })
        };

        let mut denied = 0;
        for _ in 0..10 {
            client.write_all(&encode_key_request(OP_HEALTH, b"")).await.unwrap();
            let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
            if status == STATUS_ERR {
                denied += 1;
            }
        }
        assert!(denied >= 7, "expected most requests denied, got {}", denied);

        // Connection is still usable after denials.
        client.write_all(&encode_key_request(OP_GET, b"missing")).await.unwrap();
        let (status, _) = read_response(&mut client, MAX_VALUE_SIZE).await.unwrap();
        assert_eq!(status, STATUS_ERR);

        drop(client);
        handler.await.unwrap().unwrap();
        server.coordinator.engine().close().await.unwrap();
    }
}
