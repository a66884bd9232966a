//! External key-value store access.
//!
//! - [`CacheClient`]: the get/set/exists contract every backend satisfies
//! - [`memory`]: in-process store with lazy TTL expiry
//! - [`disk`]: one-file-per-key store with optional zstd compression
//!
//! Stores do not retry. Failures surface as [`StoreError`] and retry policy is
//! left to the caller.

pub mod disk;
pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StoreBackend, StoreConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store rejected write for key {0}")]
    Rejected(String),
}

/// A byte-oriented key-value store shared across tasks.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Store `value` under `key`, overwriting any previous value.
    ///
    /// Returns whether the store accepted the write.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError>;

    /// Fetch the value under `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write several entries in order, one result per entry.
    ///
    /// Backends with a cheaper pipelined path override this.
    async fn set_batch(
        &self,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Vec<Result<bool, StoreError>> {
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push(self.set(&key, value, ttl).await);
        }
        results
    }

    /// Release the connection. Later calls fail with [`StoreError::Connection`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Shared handle to a store.
pub type SharedClient = Arc<dyn CacheClient>;

/// Bound a store call by `timeout`.
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> Result<SharedClient, StoreError> {
    let client: SharedClient = match config.backend {
        StoreBackend::Memory => Arc::new(memory::MemoryStore::new()),
        StoreBackend::Disk => {
            let zstd_level = config.zstd_compression.then_some(config.zstd_level);
            Arc::new(disk::DiskStore::open(config.path.clone(), zstd_level).await?)
        }
    };
    info!(backend = ?config.backend, "Connected to store");
    Ok(client)
}

/// Run `f` with `client` and close the client afterwards, whatever `f` returned.
///
/// A close failure is logged and does not override `f`'s result.
pub async fn with_session<T, F, Fut>(client: SharedClient, f: F) -> T
where
    F: FnOnce(SharedClient) -> Fut,
    Fut: Future<Output = T>,
{
    let result = f(client.clone()).await;
    if let Err(e) = client.close().await {
        warn!("Closing store failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_deadline_elapses() {
        let result: Result<(), StoreError> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_session_closes_on_error() {
        let store = Arc::new(MemoryStore::new());
        let client: SharedClient = store.clone();

        let result: anyhow::Result<()> = with_session(client, |c| async move {
            c.set("k", Bytes::from_static(b"v"), None).await?;
            anyhow::bail!("job failed")
        })
        .await;

        assert!(result.is_err());
        assert!(store.is_closed());
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_set_batch_preserves_order() {
        let store = MemoryStore::new();
        let entries = vec![
            ("a".to_string(), Bytes::from_static(b"1")),
            ("a".to_string(), Bytes::from_static(b"2")),
        ];
        let results = store.set_batch(entries, None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Ok(true))));
        // Last write wins.
        assert_eq!(store.get("a").await.unwrap().unwrap(), Bytes::from_static(b"2"));
    }
}
