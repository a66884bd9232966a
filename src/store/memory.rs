//! In-process key-value store.
//!
//! Values live in a `HashMap` behind a tokio `RwLock`. TTLs are enforced
//! lazily: an expired entry is treated as absent on read and purged on the
//! next write to the same key or by [`MemoryStore::purge_expired`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::{CacheClient, StoreError};

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// Usage counters for a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Connection("memory store is closed".into()));
        }
        Ok(())
    }

    /// Live entries and their total value size.
    pub async fn stats(&self) -> MemoryStats {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|e| e.is_live(now))
            .fold(MemoryStats::default(), |mut s, e| {
                s.entries += 1;
                s.bytes += e.value.len();
                s
            })
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

/// A TTL too large to represent as an `Instant` never expires.
fn entry(value: Bytes, ttl: Option<Duration>) -> Entry {
    Entry {
        value,
        expires_at: ttl.and_then(|d| Instant::now().checked_add(d)),
    }
}

#[async_trait]
impl CacheClient for MemoryStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let size = value.len();
        self.entries
            .write()
            .await
            .insert(key.to_string(), entry(value, ttl));
        debug!(key, size, "Stored value in memory");
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn set_batch(
        &self,
        batch: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Vec<Result<bool, StoreError>> {
        if let Err(e) = self.ensure_open() {
            let reason = e.to_string();
            return batch
                .iter()
                .map(|_| Err(StoreError::Connection(reason.clone())))
                .collect();
        }

        // One lock acquisition for the whole batch, applied in order.
        let mut entries = self.entries.write().await;
        batch
            .into_iter()
            .map(|(key, value)| {
                entries.insert(key, entry(value, ttl));
                Ok(true)
            })
            .collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entries.write().await.clear();
            debug!("Memory store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_exists() {
        let store = MemoryStore::new();
        assert!(!store.exists("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        assert!(store.set("k", Bytes::from_static(b"abc"), None).await.unwrap());
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.set("k", Bytes::from_static(b"same"), None).await.unwrap();
        }
        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 4);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", Bytes::from_static(b"x"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("long", Bytes::from_static(b"y"), None).await.unwrap();
        assert!(store.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("short").await.unwrap());
        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await, 1);
        assert!(store.exists("long").await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = MemoryStore::new();
        assert!(store
            .set("k", Bytes::from_static(b"v"), Some(Duration::MAX))
            .await
            .unwrap());
        let results = store
            .set_batch(
                vec![("b".to_string(), Bytes::from_static(b"w"))],
                Some(Duration::from_secs(u64::MAX)),
            )
            .await;
        assert!(matches!(results[0], Ok(true)));

        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.get("b").await.unwrap().unwrap(), Bytes::from_static(b"w"));
        assert_eq!(store.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        // Closing twice is fine.
        store.close().await.unwrap();

        assert!(matches!(
            store.set("k", Bytes::new(), None).await,
            Err(StoreError::Connection(_))
        ));
        let results = store
            .set_batch(vec![("k".to_string(), Bytes::new())], None)
            .await;
        assert!(matches!(results[0], Err(StoreError::Connection(_))));
    }
}
