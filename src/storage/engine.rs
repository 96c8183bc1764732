//! Storage engine for one node
//!
//! Composes the sharded cache, the write-ahead log and the two-level
//! on-disk value directory. This is the unit that services Set/Get/Delete
//! locally; the cluster coordinator drives it for replicated operations.
//!
//! Startup order: replay the WAL into the cache (tombstones delete), write
//! the replayed survivors through to the directory so no record has its
//! only copy in the log, warm the cache from the directory up to the size
//! ceiling, then truncate the WAL.

use crate::common::{h64, object_path, Error, Result, MAX_VALUE_SIZE};
use crate::storage::{Cache, Wal};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

const EXPECTED_ITEMS: usize = 100_000;

pub struct StorageEngine {
    data_dir: PathBuf,
    cache: Cache,
    wal: Wal,
    max_cache_bytes: i64,
    disk_size: AtomicI64,
}

impl StorageEngine {
    /// Open the engine rooted at `data_dir`, recovering state from the WAL
    /// and the value directory.
    pub async fn open(data_dir: &Path, max_cache_bytes: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let cache = Cache::new(EXPECTED_ITEMS);
        let wal_path = data_dir.join("wal.log");

        // Replay before the flusher owns the file.
        let mut replayed: HashMap<u64, Option<Vec<u8>>> = HashMap::new();
        Wal::replay(&wal_path, |hash, data| {
            if data.is_empty() {
                replayed.insert(hash, None);
            } else {
                replayed.insert(hash, Some(data));
            }
            Ok(())
        })?;

        let wal = Wal::open(data_dir).await?;

        let engine = Self {
            data_dir: data_dir.to_path_buf(),
            cache,
            wal,
            max_cache_bytes: max_cache_bytes as i64,
            disk_size: AtomicI64::new(0),
        };

        let recovered = replayed.len();
        for (hash, value) in replayed {
            match value {
                Some(data) => {
                    engine.cache.set(hash, data.clone());
                    engine.write_object(hash, &data).await?;
                }
                None => {
                    engine.cache.del(hash);
                    engine.remove_object(hash).await?;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(records = recovered, "WAL replayed");
        }

        // The directory walk counts every value file, including the ones
        // the replay just wrote through.
        engine.disk_size.store(0, Ordering::Relaxed);
        engine.warm_cache().await?;
        engine.wal.truncate().await?;

        tracing::info!(
            items = engine.cache.items(),
            cache_bytes = engine.cache.size(),
            disk_bytes = engine.disk_size.load(Ordering::Relaxed),
            "storage engine opened"
        );

        Ok(engine)
    }

    /// Store a value. Rejects values over the 100 MiB cap without mutating
    /// any state.
    ///
    /// An empty value is a deletion: the WAL record format cannot tell an
    /// empty value from a tombstone, so the engine treats them uniformly.
    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::TooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        if value.is_empty() {
            return self.delete(key).await;
        }

        let hash = h64(key);
        self.wal.append(hash, value.clone())?;
        self.write_object(hash, &value).await?;
        self.cache.set(hash, value);

        if self.cache.size() > self.max_cache_bytes {
            self.cache.evict(self.max_cache_bytes);
        }

        Ok(())
    }

    /// Fetch a value, falling through to disk on a cache miss. A disk hit
    /// is warmed back into the cache.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let hash = h64(key);

        if let Some(data) = self.cache.get(hash) {
            return Ok(data);
        }

        match tokio::fs::read(object_path(&self.data_dir, hash)).await {
            Ok(data) => {
                self.cache.set(hash, data.clone());
                if self.cache.size() > self.max_cache_bytes {
                    self.cache.evict(self.max_cache_bytes);
                }
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a key. A missing on-disk file is tolerated silently.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let hash = h64(key);
        self.wal.append(hash, Vec::new())?;
        self.cache.del(hash);
        self.remove_object(hash).await?;
        Ok(())
    }

    /// Cache-only membership check; keys resident only on disk report false.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.cache.contains(h64(key))
    }

    /// Drain the WAL flusher and stop it.
    pub async fn close(&self) -> Result<()> {
        self.wal.close().await
    }

    pub fn cache_items(&self) -> i64 {
        self.cache.items()
    }

    pub fn cache_size(&self) -> i64 {
        self.cache.size()
    }

    pub fn disk_size(&self) -> i64 {
        self.disk_size.load(Ordering::Relaxed)
    }

    /// Write a value file via temp-then-rename, keeping the disk size
    /// counter in step.
    async fn write_object(&self, hash: u64, data: &[u8]) -> Result<()> {
        let path = object_path(&self.data_dir, hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;

        let old_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        self.disk_size
            .fetch_add(data.len() as i64 - old_len, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_object(&self, hash: u64) -> Result<()> {
        let path = object_path(&self.data_dir, hash);
        let old_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.disk_size.fetch_sub(old_len, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the two-level fanout directories, loading values into the cache
    /// until the ceiling is reached. `.tmp` leftovers and `.log` files are
    /// skipped. Disk size is counted for every value file regardless of
    /// whether it still fits in the cache.
    async fn warm_cache(&self) -> Result<()> {
        let mut top = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir_entry) = top.next_entry().await? {
            if !dir_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                let path = file_entry.path();
                match path.extension().and_then(|s| s.to_str()) {
                    Some("tmp") | Some("log") => continue,
                    _ => {}
                }

                let name = match path.file_name().and_then(|s| s.to_str()) {
                    Some(name) => name,
                    None => continue,
                };
                let hash = match u64::from_str_radix(name, 16) {
                    Ok(hash) => hash,
                    Err(_) => continue,
                };

                let len = file_entry.metadata().await?.len() as i64;
                self.disk_size.fetch_add(len, Ordering::Relaxed);

                if self.cache.size() < self.max_cache_bytes && !self.cache.contains(hash) {
                    let data = tokio::fs::read(&path).await?;
                    self.cache.set(hash, data);
                }
            }
        }

        Ok(())
    }
}
