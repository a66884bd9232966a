//! Read side of the cache: prefix hit detection and chunk retrieval.
//!
//! Because keys are prefix hashes, a sequence's cached state is always a
//! chunk-aligned prefix. Lookups walk chunks from the start and stop at the
//! first missing key.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::cache::chunker::{chunk_hashes, ChunkError};
use crate::cache::codec::{BlobShape, CodecError, KvLayout, TensorBlob};
use crate::cache::hashing::TokenId;
use crate::cache::key::KeyBuilder;
use crate::metrics::Metrics;
use crate::store::{with_deadline, SharedClient, StoreError};

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cached chunk could not be decoded: {0}")]
    Codec(#[from] CodecError),

    #[error("Key format '{key_format}' does not match {layout} blob layout")]
    FormatMismatch { key_format: String, layout: KvLayout },
}

pub struct Lookup {
    client: SharedClient,
    keys: KeyBuilder,
    chunk_size: usize,
    op_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Lookup {
    pub fn new(client: SharedClient, keys: KeyBuilder, chunk_size: usize, op_timeout: Duration) -> Self {
        Self {
            client,
            keys,
            chunk_size,
            op_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of leading tokens of `tokens` whose chunks are all cached.
    pub async fn cached_prefix_len(&self, tokens: &[TokenId]) -> Result<usize, LookupError> {
        let mut cached = 0;
        for hash in chunk_hashes(tokens, self.chunk_size)? {
            let key = self.keys.key_for(&hash);
            if !with_deadline(self.op_timeout, self.client.exists(&key)).await? {
                self.record_miss();
                break;
            }
            self.record_hit();
            cached += self.chunk_size;
        }
        debug!(tokens = tokens.len(), cached, "Prefix lookup");
        Ok(cached)
    }

    /// Fetch and reassemble the cached prefix of `tokens`.
    ///
    /// Returns `None` when the first chunk is not cached. `shape` describes
    /// how the stored chunk bytes are laid out and its layout must match the
    /// key format.
    pub async fn retrieve_prefix(
        &self,
        tokens: &[TokenId],
        shape: &BlobShape,
    ) -> Result<Option<TensorBlob>, LookupError> {
        if self.keys.format() != shape.layout.tag() {
            return Err(LookupError::FormatMismatch {
                key_format: self.keys.format().to_string(),
                layout: shape.layout,
            });
        }
        let mut parts = Vec::new();
        for hash in chunk_hashes(tokens, self.chunk_size)? {
            let key = self.keys.key_for(&hash);
            match with_deadline(self.op_timeout, self.client.get(&key)).await? {
                Some(bytes) => {
                    self.record_hit();
                    parts.push(shape.decode(bytes, self.chunk_size)?);
                }
                None => {
                    self.record_miss();
                    break;
                }
            }
        }

        if parts.is_empty() {
            return Ok(None);
        }
        debug!(chunks = parts.len(), "Retrieved cached prefix");
        Ok(Some(TensorBlob::concat(&parts)?))
    }

    fn record_hit(&self) {
        if let Some(m) = &self.metrics {
            m.lookup_hits.inc();
        }
    }

    fn record_miss(&self) {
        if let Some(m) = &self.metrics {
            m.lookup_misses.inc();
        }
    }
}
