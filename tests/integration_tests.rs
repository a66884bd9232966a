//! Integration tests for the insertion pipeline against real and faulty stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use kv_chunk_cache::cache::chunker::chunk_hashes;
use kv_chunk_cache::cache::codec::{pack, KvLayout, TensorBlob};
use kv_chunk_cache::cache::hashing::TokenId;
use kv_chunk_cache::cache::key::KeyBuilder;
use kv_chunk_cache::config::{Config, ModelConfig, StoreBackend};
use kv_chunk_cache::metrics::Metrics;
use kv_chunk_cache::pipeline::cancel::CancelToken;
use kv_chunk_cache::pipeline::insert::{InsertError, InsertOptions, InsertionDriver};
use kv_chunk_cache::pipeline::lookup::{Lookup, LookupError};
use kv_chunk_cache::store::memory::MemoryStore;
use kv_chunk_cache::store::{self, CacheClient, SharedClient, StoreError};
use kv_chunk_cache::synth::{generate_kv_cache, generate_tokens};

fn tiny_model(layout: KvLayout) -> ModelConfig {
    ModelConfig {
        num_layers: 2,
        num_kv_heads: 2,
        head_size: 4,
        layout,
        ..Default::default()
    }
}

fn sequence(seed: u64, num_tokens: usize, layout: KvLayout) -> (Vec<TokenId>, TensorBlob) {
    let mut rng = StdRng::seed_from_u64(seed);
    let tokens = generate_tokens(&mut rng, num_tokens);
    let layers = generate_kv_cache(&mut rng, num_tokens, &tiny_model(layout), layout).unwrap();
    (tokens, pack(&layers, layout).unwrap())
}

fn keys() -> KeyBuilder {
    keys_for(KvLayout::Vllm)
}

fn keys_for(layout: KvLayout) -> KeyBuilder {
    KeyBuilder::new(layout.tag(), "llama3-70B", 1, 0).unwrap()
}

fn driver(client: SharedClient, chunk_size: usize, batch_size: usize) -> InsertionDriver {
    InsertionDriver::new(
        client,
        keys(),
        InsertOptions {
            chunk_size,
            batch_size,
            ..Default::default()
        },
    )
}

/// Fails the n-th `set` call (0-based) and forwards everything else.
struct FlakyStore {
    inner: MemoryStore,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl CacheClient for FlakyStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(StoreError::Connection("connection reset".into()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

/// Never answers a write.
struct StalledStore;

#[async_trait]
impl CacheClient for StalledStore {
    async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<bool, StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(true)
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Cancels `token` once `after` writes have been accepted.
struct CancellingStore {
    inner: MemoryStore,
    token: CancelToken,
    after: usize,
    writes: AtomicUsize,
}

#[async_trait]
impl CacheClient for CancellingStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let accepted = self.inner.set(key, value, ttl).await?;
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(accepted)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_failed_chunk_does_not_stop_the_job() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        calls: AtomicUsize::new(0),
        fail_on: 5,
    });
    let (tokens, blob) = sequence(1, 10 * 16, KvLayout::Vllm);
    let expected: Vec<String> = chunk_hashes(&tokens, 16)
        .unwrap()
        .iter()
        .map(|h| keys().key_for(h))
        .collect();

    let report = driver(store.clone(), 16, 3)
        .insert_sequence(&tokens, &blob, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 10);
    assert_eq!(report.written_count(), 9);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 5);
    assert_eq!(report.failed[0].key, expected[5]);
    assert!(matches!(report.failed[0].error, StoreError::Connection(_)));

    // Chunks after the failure were still written.
    for (i, key) in expected.iter().enumerate() {
        assert_eq!(store.exists(key).await.unwrap(), i != 5, "chunk {i}");
    }
    assert!(report.into_result().is_err());
}

#[tokio::test]
async fn test_stalled_store_times_out_per_batch() {
    let (tokens, blob) = sequence(2, 64, KvLayout::Vllm);
    let driver = InsertionDriver::new(
        Arc::new(StalledStore),
        keys(),
        InsertOptions {
            chunk_size: 16,
            batch_size: 2,
            op_timeout: Duration::from_millis(20),
            ttl: None,
        },
    );

    let report = driver
        .insert_sequence(&tokens, &blob, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.written_count(), 0);
    assert_eq!(report.failed.len(), 4);
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, StoreError::Timeout(_))));
}

#[tokio::test]
async fn test_cancellation_between_chunks() {
    let cancel = CancelToken::new();
    let store = Arc::new(CancellingStore {
        inner: MemoryStore::new(),
        token: cancel.clone(),
        after: 3,
        writes: AtomicUsize::new(0),
    });
    let (tokens, blob) = sequence(3, 8 * 16, KvLayout::Vllm);

    let report = driver(store.clone(), 16, 1)
        .insert_sequence(&tokens, &blob, &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total_chunks, 8);
    assert_eq!(report.written_count(), 3);
    assert!(report.failed.is_empty());
    assert_eq!(store.inner.stats().await.entries, 3);
}

#[tokio::test]
async fn test_concurrent_drivers_share_one_store() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new().unwrap());

    let mut handles = Vec::new();
    for seed in 0..4u64 {
        let client: SharedClient = store.clone();
        let metrics = metrics.clone();
        handles.push(tokio::spawn(async move {
            let (tokens, blob) = sequence(100 + seed, 5 * 8, KvLayout::Vllm);
            driver(client, 8, 2)
                .with_metrics(metrics)
                .insert_sequence(&tokens, &blob, &CancelToken::new())
                .await
                .unwrap()
        }));
    }

    let mut written = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        assert!(report.is_complete());
        written += report.written_count();
    }

    assert_eq!(written, 20);
    assert_eq!(store.stats().await.entries, 20);
    assert_eq!(metrics.chunks_written.get(), 20);
    assert_eq!(metrics.sequences_inserted.get(), 4);
}

#[tokio::test]
async fn test_identical_prefix_reuses_keys() {
    let store = Arc::new(MemoryStore::new());
    let (tokens, blob) = sequence(4, 4 * 8, KvLayout::Vllm);

    let first = driver(store.clone(), 8, 4)
        .insert_sequence(&tokens, &blob, &CancelToken::new())
        .await
        .unwrap();
    let second = driver(store.clone(), 8, 4)
        .insert_sequence(&tokens, &blob, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(first.written, second.written);
    assert_eq!(store.stats().await.entries, 4);
}

#[tokio::test]
async fn test_insert_then_retrieve_prefix() {
    for layout in [KvLayout::Vllm, KvLayout::HuggingFace] {
        let store = Arc::new(MemoryStore::new());
        let (tokens, blob) = sequence(5, 50, layout);

        let options = InsertOptions {
            chunk_size: 16,
            batch_size: 2,
            ..Default::default()
        };
        let report = InsertionDriver::new(store.clone(), keys_for(layout), options)
            .insert_sequence(&tokens, &blob, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.total_chunks, 3);
        assert_eq!(report.dropped_tokens, 2);
        assert!(report.written.iter().all(|k| k.starts_with(layout.tag())));

        let lookup = Lookup::new(store.clone(), keys_for(layout), 16, Duration::from_secs(1));
        assert_eq!(lookup.cached_prefix_len(&tokens).await.unwrap(), 48);

        let shape = tiny_model(layout).blob_shape();
        let cached = lookup.retrieve_prefix(&tokens, &shape).await.unwrap().unwrap();
        assert_eq!(cached, blob.slice_tokens(0..48).unwrap());

        // A sequence sharing only the first chunk hits one chunk.
        let mut other = tokens.clone();
        other[20] += 1;
        assert_eq!(lookup.cached_prefix_len(&other).await.unwrap(), 16);
    }
}

#[tokio::test]
async fn test_layout_and_key_format_must_agree() {
    let store = Arc::new(MemoryStore::new());
    let (tokens, blob) = sequence(7, 32, KvLayout::HuggingFace);

    let result = driver(store.clone(), 16, 2)
        .insert_sequence(&tokens, &blob, &CancelToken::new())
        .await;
    assert!(matches!(
        result,
        Err(InsertError::FormatMismatch {
            layout: KvLayout::HuggingFace,
            ..
        })
    ));
    assert_eq!(store.stats().await.entries, 0);

    let lookup = Lookup::new(store, keys(), 16, Duration::from_secs(1));
    let shape = tiny_model(KvLayout::HuggingFace).blob_shape();
    assert!(matches!(
        lookup.retrieve_prefix(&tokens, &shape).await,
        Err(LookupError::FormatMismatch { .. })
    ));
}

#[tokio::test]
async fn test_disk_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store.backend = StoreBackend::Disk;
    config.store.path = dir.path().to_path_buf();
    config.store.zstd_compression = true;
    config.chunking.chunk_size = 16;
    config.model = tiny_model(KvLayout::Vllm);

    let (tokens, blob) = sequence(6, 64, KvLayout::Vllm);
    let expected = blob.clone();
    let client = store::connect(&config.store).await.unwrap();
    let options = InsertOptions::from_config(&config);
    let shape = config.model.blob_shape();

    let cached = store::with_session(client, |client| async move {
        let report = InsertionDriver::new(client.clone(), keys(), options.clone())
            .insert_sequence(&tokens, &blob, &CancelToken::new())
            .await
            .unwrap();
        assert!(report.is_complete());

        Lookup::new(client, keys(), options.chunk_size, options.op_timeout)
            .retrieve_prefix(&tokens, &shape)
            .await
            .unwrap()
    })
    .await;

    assert_eq!(cached.unwrap(), expected);
}
