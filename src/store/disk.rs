//! Disk-backed key-value store.
//!
//! One file per key under a root directory. Keys are hashed to file names so
//! arbitrary key strings are safe on any filesystem, and files are sharded
//! into 256 subdirectories by the first byte of that hash:
//!
//! ```text
//! <root>/3f/3fa9...e1.kv
//! ```
//!
//! Each file starts with a one-byte header: `0` for raw bytes, `1` for a
//! zstd frame. Writes go to a temporary file that is then renamed over the
//! target, so readers never observe a partial value. TTLs are accepted and
//! not enforced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::store::{CacheClient, StoreError};

const RAW: u8 = 0;
const ZSTD: u8 = 1;

/// Transfer counters for a [`DiskStore`].
#[derive(Debug, Default)]
pub struct DiskStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

pub struct DiskStore {
    root: PathBuf,

    /// zstd level for new writes, `None` to store raw bytes.
    zstd_level: Option<i32>,

    stats: DiskStats,

    closed: AtomicBool,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: PathBuf, zstd_level: Option<i32>) -> Result<Self, StoreError> {
        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::Connection(format!("cannot open store at {}: {e}", root.display()))
        })?;
        debug!(root = %root.display(), ?zstd_level, "Opened disk store");
        Ok(Self {
            root,
            zstd_level,
            stats: DiskStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Connection("disk store is closed".into()));
        }
        Ok(())
    }

    /// File path holding `key`.
    fn key_path(&self, key: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(format!("{digest}.kv"))
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::with_capacity(value.len() + 1);
        match self.zstd_level {
            Some(level) => {
                out.push(ZSTD);
                out.extend_from_slice(&zstd::encode_all(value, level)?);
            }
            None => {
                out.push(RAW);
                out.extend_from_slice(value);
            }
        }
        Ok(out)
    }

    fn decode(key: &str, data: &[u8]) -> Result<Bytes, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };
        match data.split_first() {
            Some((&RAW, body)) => Ok(Bytes::copy_from_slice(body)),
            Some((&ZSTD, body)) => zstd::decode_all(body)
                .map(Bytes::from)
                .map_err(|e| corrupt(format!("zstd: {e}"))),
            Some((tag, _)) => Err(corrupt(format!("unknown header byte {tag}"))),
            None => Err(corrupt("empty file".into())),
        }
    }
}

#[async_trait]
impl CacheClient for DiskStore {
    async fn set(&self, key: &str, value: Bytes, _ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = self.encode(&value)?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &encoded).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(
            key,
            path = %path.display(),
            size = value.len(),
            stored = encoded.len(),
            "Wrote value to disk"
        );

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.ensure_open()?;
        let path = self.key_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Self::decode(key, &data).map(Some)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(fs::try_exists(self.key_path(key)).await?)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                root = %self.root.display(),
                writes = self.stats.total_writes.load(Ordering::Relaxed),
                reads = self.stats.total_reads.load(Ordering::Relaxed),
                "Disk store closed"
            );
        }
        Ok(())
    }
}
