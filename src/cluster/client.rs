//! Binary protocol client for peer-to-peer calls
//!
//! One connection pool per remote peer. When an auth key is configured the
//! client authenticates each freshly-dialed connection once; pooled
//! connections remember their authentication state, so subsequent calls
//! skip the AUTH round-trip. Any I/O error or auth failure drops the
//! connection instead of returning it to the pool.

use crate::cluster::pool::{ConnPool, PooledConn};
use crate::common::{compress, Error, Result, MAX_VALUE_SIZE};
use crate::protocol::{
    encode_key_request, encode_value_request, read_response, OP_AUTH, OP_DELETE, OP_GET,
    OP_HEALTH, OP_SET, OP_SYNC, STATUS_OK,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

const IO_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    pools: RwLock<HashMap<String, Arc<ConnPool>>>,
    auth_key: String,
}

impl Client {
    pub fn new(auth_key: String) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            auth_key,
        }
    }

    fn pool(&self, addr: &str) -> Arc<ConnPool> {
        if let Some(pool) = self.pools.read().get(addr) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(ConnPool::new(addr.to_string())))
            .clone()
    }

    /// Replicate a value to a peer's local engine. Compresses when it pays
    /// off.
    pub async fn sync(&self, addr: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(addr, OP_SYNC, key, value).await
    }

    /// Store a value through a node's quorum write path.
    pub async fn set(&self, addr: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(addr, OP_SET, key, value).await
    }

    async fn store(&self, addr: &str, op: u8, key: &[u8], value: &[u8]) -> Result<()> {
        let (payload, compressed) = compress(value);
        let request = encode_value_request(op, key, &payload, compressed);
        let (status, _) = self.call(addr, &request).await?;
        if status != STATUS_OK {
            return Err(Error::PeerError);
        }
        Ok(())
    }

    /// Fetch a value from a peer. An error status means not found.
    pub async fn get(&self, addr: &str, key: &[u8]) -> Result<Vec<u8>> {
        let request = encode_key_request(OP_GET, key);
        let (status, payload) = self.call(addr, &request).await?;
        if status != STATUS_OK {
            return Err(Error::NotFound);
        }
        Ok(payload)
    }

    pub async fn delete(&self, addr: &str, key: &[u8]) -> Result<()> {
        let request = encode_key_request(OP_DELETE, key);
        let (status, _) = self.call(addr, &request).await?;
        if status != STATUS_OK {
            return Err(Error::PeerError);
        }
        Ok(())
    }

    /// Health snapshot of a peer, as raw JSON bytes.
    pub async fn health(&self, addr: &str) -> Result<Vec<u8>> {
        let request = encode_key_request(OP_HEALTH, b"");
        let (status, payload) = self.call(addr, &request).await?;
        if status != STATUS_OK {
            return Err(Error::PeerError);
        }
        Ok(payload)
    }

    /// One request/response over a pooled connection. The connection is
    /// returned to the pool only after a cleanly framed response.
    async fn call(&self, addr: &str, request: &[u8]) -> Result<(u8, Vec<u8>)> {
        let pool = self.pool(addr);
        let mut conn = pool.get().await?;

        self.ensure_auth(&mut conn).await?;

        let result = timeout(IO_TIMEOUT, async {
            conn.stream.write_all(request).await?;
            read_response(&mut conn.stream, MAX_VALUE_SIZE).await
        })
        .await
        .map_err(|_| Error::Timeout(format!("request to {}", addr)))?;

        match result {
            Ok(response) => {
                pool.put(conn);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    /// Authenticate a fresh connection once; no-op when no key is
    /// configured or the connection already authenticated.
    async fn ensure_auth(&self, conn: &mut PooledConn) -> Result<()> {
        if self.auth_key.is_empty() || conn.authenticated {
            return Ok(());
        }

        let request = encode_key_request(OP_AUTH, self.auth_key.as_bytes());
        let (status, _) = timeout(AUTH_TIMEOUT, async {
            conn.stream.write_all(&request).await?;
            read_response(&mut conn.stream, 0).await
        })
        .await
        .map_err(|_| Error::Timeout("auth".into()))??;

        if status != STATUS_OK {
            return Err(Error::AuthFailed);
        }
        conn.authenticated = true;
        Ok(())
    }
}
