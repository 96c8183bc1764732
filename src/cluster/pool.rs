//! Per-peer TCP connection pool
//!
//! Bounded LIFO pool: `get` pops the most-recently idle connection or dials
//! fresh with a short timeout; `put` returns a healthy connection or drops
//! it when the pool is full. A connection that saw any error must be
//! dropped, never returned, since its stream may be desynchronized.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const POOL_SIZE: usize = 10;
const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// A pooled connection with its per-connection authentication state.
pub struct PooledConn {
    pub stream: TcpStream,
    pub authenticated: bool,
}

pub struct ConnPool {
    addr: String,
    idle: Mutex<Vec<PooledConn>>,
}

impl ConnPool {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            idle: Mutex::new(Vec::with_capacity(POOL_SIZE)),
        }
    }

    /// Pop the most-recent idle connection, else dial.
    pub async fn get(&self) -> Result<PooledConn> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        self.dial().await
    }

    /// Return a healthy connection; drops it when the pool is full.
    pub fn put(&self, conn: PooledConn) {
        let mut idle = self.idle.lock();
        if idle.len() < POOL_SIZE {
            idle.push(conn);
        }
    }

    async fn dial(&self) -> Result<PooledConn> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(format!("dial {}", self.addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.addr, e)))?;

        stream.set_nodelay(true)?;

        Ok(PooledConn {
            stream,
            authenticated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_and_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnPool::new(addr);
        let conn = pool.get().await.unwrap();
        assert!(!conn.authenticated);

        pool.put(conn);
        assert_eq!(pool.idle.lock().len(), 1);

        let _conn = pool.get().await.unwrap();
        assert!(pool.idle.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pool_caps_idle_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnPool::new(addr);
        let mut conns = Vec::new();
        for _ in 0..POOL_SIZE + 3 {
            conns.push(pool.get().await.unwrap());
        }
        for conn in conns {
            pool.put(conn);
        }
        assert_eq!(pool.idle.lock().len(), POOL_SIZE);
    }

    #[tokio::test]
    async fn test_dial_unreachable_fails_fast() {
        // Reserved TEST-NET address; nothing listens there.
        let pool = ConnPool::new("192.0.2.1:9".to_string());
        let started = std::time::Instant::now();
        assert!(pool.get().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
