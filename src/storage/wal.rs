//! Write-ahead log
//!
//! Append-only record log with per-record framing:
//!
//! ```text
//! [MAGIC:u16=0xDEAD][KEY_HASH:u64][VALUE_LEN:u32][CRC:u16][VALUE]
//! ```
//!
//! All integers little-endian; the checksum is the low 16 bits of CRC32 over
//! the value bytes; a zero-length value is a tombstone.
//!
//! Appends are enqueued to a flusher task which batches, coalesces by key
//! (last write wins) and fsyncs. The flusher compacts the log in place once
//! it grows past a threshold: survivors are rewritten to a temporary file
//! which is renamed over the live log. Replay stops silently at the first
//! corrupt or truncated record, so a torn tail never poisons recovery.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior};

const WAL_MAGIC: u16 = 0xDEAD;
const RECORD_HEADER: usize = 16;
const MAX_BATCH_RECORDS: usize = 1000;
const MAX_BATCH_BYTES: usize = 1024 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const COMPACT_MIN_BYTES: u64 = 40 * 1024;

enum Msg {
    Record { hash: u64, data: Vec<u8> },
    Truncate(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the write-ahead log. Appends are asynchronous: durability is
/// reached on the next flusher tick, not on return from `append`.
pub struct Wal {
    tx: mpsc::UnboundedSender<Msg>,
    last_error: Arc<Mutex<Option<std::io::Error>>>,
}

impl Wal {
    /// Open (or create) `wal.log` under `dir` and start the flusher task.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("wal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let last_error = Arc::new(Mutex::new(None));

        tokio::spawn(flusher(file, path, rx, last_error.clone()));

        Ok(Self { tx, last_error })
    }

    /// Enqueue a record. An empty `data` is a tombstone.
    ///
    /// A write error from a previous flush surfaces here, on the next
    /// caller; the failed batch itself is not re-enqueued.
    pub fn append(&self, hash: u64, data: Vec<u8>) -> Result<()> {
        if let Some(err) = self.last_error.lock().take() {
            return Err(Error::Io(err));
        }
        self.tx
            .send(Msg::Record { hash, data })
            .map_err(|_| Error::Wal("log closed".into()))
    }

    /// Reset the log to zero length. Used after a successful full load at
    /// startup, once the reconstructed state is consistent.
    pub async fn truncate(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Msg::Truncate(ack_tx))
            .map_err(|_| Error::Wal("log closed".into()))?;
        ack_rx.await.map_err(|_| Error::Wal("flusher gone".into()))?
    }

    /// Drain pending records, flush and stop the flusher.
    pub async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    /// Stream records from a log file in append order. Stops at the first
    /// record with a bad magic, short length or checksum mismatch; a
    /// truncated tail is benign.
    pub fn replay<F>(path: &Path, mut callback: F) -> Result<()>
    where
        F: FnMut(u64, Vec<u8>) -> Result<()>,
    {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        parse_records(&buf, |hash, data| callback(hash, data.to_vec()))
    }
}

fn encode_record(buf: &mut Vec<u8>, hash: u64, data: &[u8]) {
    buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&hash.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&((crc32fast::hash(data) & 0xFFFF) as u16).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Walk records in `buf`, stopping at the first invalid one.
fn parse_records<F>(buf: &[u8], mut callback: F) -> Result<()>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let mut pos = 0;
    while buf.len() - pos >= RECORD_HEADER {
        let magic = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap());
        if magic != WAL_MAGIC {
            break;
        }

        let hash = u64::from_le_bytes(buf[pos + 2..pos + 10].try_into().unwrap());
        let len = u32::from_le_bytes(buf[pos + 10..pos + 14].try_into().unwrap()) as usize;
        let checksum = u16::from_le_bytes(buf[pos + 14..pos + 16].try_into().unwrap());

        let start = pos + RECORD_HEADER;
        if buf.len() - start < len {
            break;
        }
        let data = &buf[start..start + len];
        if (crc32fast::hash(data) & 0xFFFF) as u16 != checksum {
            break;
        }

        callback(hash, data)?;
        pos = start + len;
    }
    Ok(())
}

async fn flusher(
    mut file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    last_error: Arc<Mutex<Option<std::io::Error>>>,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Coalescing batch: insertion order of first sight, latest value wins.
    let mut order: Vec<u64> = Vec::with_capacity(MAX_BATCH_RECORDS);
    let mut batch: HashMap<u64, Vec<u8>> = HashMap::with_capacity(MAX_BATCH_RECORDS);
    let mut batch_bytes = 0usize;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Msg::Record { hash, data }) => {
                    batch_bytes += data.len();
                    if batch.insert(hash, data).is_none() {
                        order.push(hash);
                    }
                    if order.len() >= MAX_BATCH_RECORDS || batch_bytes >= MAX_BATCH_BYTES {
                        flush(&mut file, &path, &mut order, &mut batch, &last_error).await;
                        batch_bytes = 0;
                    }
                }
                Some(Msg::Truncate(ack)) => {
                    order.clear();
                    batch.clear();
                    batch_bytes = 0;
                    let result = async {
                        file.set_len(0).await?;
                        file.sync_all().await?;
                        Ok(())
                    }
                    .await;
                    let _ = ack.send(result);
                }
                Some(Msg::Shutdown(ack)) => {
                    flush(&mut file, &path, &mut order, &mut batch, &last_error).await;
                    let _ = ack.send(());
                    return;
                }
                None => {
                    flush(&mut file, &path, &mut order, &mut batch, &last_error).await;
                    return;
                }
            },
            _ = interval.tick() => {
                if !order.is_empty() {
                    flush(&mut file, &path, &mut order, &mut batch, &last_error).await;
                    batch_bytes = 0;
                }
            }
        }
    }
}

async fn flush(
    file: &mut File,
    path: &Path,
    order: &mut Vec<u64>,
    batch: &mut HashMap<u64, Vec<u8>>,
    last_error: &Mutex<Option<std::io::Error>>,
) {
    if order.is_empty() {
        return;
    }

    let mut buf = Vec::with_capacity(order.iter().map(|h| batch[h].len() + RECORD_HEADER).sum());
    for hash in order.iter() {
        encode_record(&mut buf, *hash, &batch[hash]);
    }
    order.clear();
    batch.clear();

    let result = async {
        file.write_all(&buf).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "WAL flush failed");
        *last_error.lock() = Some(e);
        return;
    }

    match file.metadata().await {
        Ok(meta) if meta.len() > COMPACT_MIN_BYTES => {
            if let Err(e) = compact(file, path).await {
                tracing::warn!(error = %e, "WAL compaction failed");
            }
        }
        _ => {}
    }
}

/// Rewrite the log to the latest record per key, dropping tombstones, via
/// write-to-temp then atomic rename.
async fn compact(file: &mut File, path: &Path) -> Result<()> {
    let raw = tokio::fs::read(path).await?;

    let mut order: Vec<u64> = Vec::new();
    let mut entries: HashMap<u64, Vec<u8>> = HashMap::new();
    parse_records(&raw, |hash, data| {
        if data.is_empty() {
            entries.remove(&hash);
        } else if entries.insert(hash, data.to_vec()).is_none() {
            order.push(hash);
        }
        Ok(())
    })?;

    let mut buf = Vec::new();
    for hash in order {
        if let Some(data) = entries.get(&hash) {
            encode_record(&mut buf, hash, data);
        }
    }

    let tmp_path = path.with_extension("log.tmp");
    let mut tmp = File::create(&tmp_path).await?;
    if let Err(e) = async {
        tmp.write_all(&buf).await?;
        tmp.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await
    {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    drop(tmp);

    tokio::fs::rename(&tmp_path, path).await?;

    // The old handle points at the renamed-over inode; reopen in append mode.
    *file = OpenOptions::new().append(true).open(path).await?;

    tracing::debug!(bytes = buf.len(), "WAL compacted");
    Ok(())
}
