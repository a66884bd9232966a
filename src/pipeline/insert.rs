//! Insertion driver: writes every whole chunk of a sequence to the store.
//!
//! For each chunk, in order:
//! 1. Build the cache key from the chunk's prefix hash
//! 2. Serialize the chunk's KV slice
//! 3. Buffer the write, flushing through `set_batch` every `batch_size` chunks
//!
//! A failed write is recorded and the driver moves on. The caller receives an
//! [`InsertionReport`] and decides whether partial failure fails the job.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::chunker::{chunk, ChunkError};
use crate::cache::codec::{KvLayout, TensorBlob};
use crate::cache::hashing::TokenId;
use crate::cache::key::{KeyBuilder, KeyError};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::pipeline::cancel::CancelToken;
use crate::store::{SharedClient, StoreError};

#[derive(Error, Debug)]
pub enum InsertError {
    #[error("{} of {} chunk writes failed", .0.failed.len(), .0.total_chunks)]
    PartialInsertionFailure(Box<InsertionReport>),

    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Invalid cache key: {0}")]
    Key(#[from] KeyError),

    #[error("Key format '{key_format}' does not match {layout} blob layout")]
    FormatMismatch { key_format: String, layout: KvLayout },
}

/// Tuning for one driver.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    /// Tokens per chunk.
    pub chunk_size: usize,

    /// Chunks per pipelined store call.
    pub batch_size: usize,

    /// Upper bound for one store call.
    pub op_timeout: Duration,

    /// Expiry for written chunks.
    pub ttl: Option<Duration>,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            batch_size: 8,
            op_timeout: Duration::from_secs(5),
            ttl: None,
        }
    }
}

impl InsertOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunking.chunk_size,
            batch_size: config.workload.batch_size,
            op_timeout: config.store.op_timeout(),
            ttl: config.store.ttl(),
        }
    }
}

/// A chunk whose write did not succeed.
#[derive(Debug)]
pub struct FailedChunk {
    pub index: usize,
    pub key: String,
    pub error: StoreError,
}

/// Outcome of inserting one sequence.
#[derive(Debug)]
pub struct InsertionReport {
    pub job_id: Uuid,

    /// Whole chunks in the sequence.
    pub total_chunks: usize,

    /// Keys written, in chunk order.
    pub written: Vec<String>,

    pub failed: Vec<FailedChunk>,

    /// Trailing tokens that did not fill a chunk.
    pub dropped_tokens: usize,

    /// Payload bytes acknowledged by the store.
    pub bytes_written: u64,

    /// The job stopped early on cancellation.
    pub cancelled: bool,
}

impl InsertionReport {
    fn new(total_chunks: usize, dropped_tokens: usize) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            total_chunks,
            written: Vec::with_capacity(total_chunks),
            failed: Vec::new(),
            dropped_tokens,
            bytes_written: 0,
            cancelled: false,
        }
    }

    pub fn written_count(&self) -> usize {
        self.written.len()
    }

    /// Every chunk was written.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.written.len() == self.total_chunks
    }

    /// Treat any failed chunk as a job failure.
    pub fn into_result(self) -> Result<Self, InsertError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(InsertError::PartialInsertionFailure(Box::new(self)))
        }
    }
}

struct PendingWrite {
    index: usize,
    key: String,
    value: Bytes,
}

/// Writes the chunks of token sequences to a shared store.
pub struct InsertionDriver {
    client: SharedClient,
    keys: KeyBuilder,
    options: InsertOptions,
    metrics: Option<Arc<Metrics>>,
}

impl InsertionDriver {
    pub fn new(client: SharedClient, keys: KeyBuilder, options: InsertOptions) -> Self {
        Self {
            client,
            keys,
            options,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &InsertOptions {
        &self.options
    }

    /// Insert every whole chunk of `tokens` with its slice of `blob`.
    ///
    /// The key format must be the blob layout's tag, so readers decode the
    /// stored bytes with the right axis order.
    ///
    /// Cancellation is checked before each chunk is admitted. Chunks already
    /// buffered when cancellation is observed are still flushed.
    pub async fn insert_sequence(
        &self,
        tokens: &[TokenId],
        blob: &TensorBlob,
        cancel: &CancelToken,
    ) -> Result<InsertionReport, InsertError> {
        if self.keys.format() != blob.layout().tag() {
            return Err(InsertError::FormatMismatch {
                key_format: self.keys.format().to_string(),
                layout: blob.layout(),
            });
        }
        let chunks = chunk(tokens, blob, self.options.chunk_size)?;
        let mut report = InsertionReport::new(chunks.len(), chunks.dropped_tokens());
        let batch_size = self.options.batch_size.max(1);

        info!(
            job_id = %report.job_id,
            tokens = tokens.len(),
            chunk_size = self.options.chunk_size,
            num_chunks = report.total_chunks,
            dropped = report.dropped_tokens,
            "Inserting sequence"
        );

        let mut pending = Vec::with_capacity(batch_size);
        for c in chunks {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            pending.push(PendingWrite {
                index: c.index,
                key: self.keys.key_for(&c.prefix_hash),
                value: c.kv.to_bytes(),
            });
            if pending.len() >= batch_size {
                self.flush(&mut pending, &mut report).await;
            }
        }
        self.flush(&mut pending, &mut report).await;

        if let Some(m) = &self.metrics {
            m.sequences_inserted.inc();
        }

        if report.cancelled {
            warn!(
                job_id = %report.job_id,
                written = report.written_count(),
                total = report.total_chunks,
                "Insertion cancelled"
            );
        } else {
            info!(
                job_id = %report.job_id,
                written = report.written_count(),
                failed = report.failed.len(),
                bytes = report.bytes_written,
                "Sequence inserted"
            );
        }

        Ok(report)
    }

    /// Write buffered chunks as one store call bounded by the op timeout.
    async fn flush(&self, pending: &mut Vec<PendingWrite>, report: &mut InsertionReport) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let entries = batch
            .iter()
            .map(|w| (w.key.clone(), w.value.clone()))
            .collect();

        let timeout = self.options.op_timeout;
        let results = match tokio::time::timeout(
            timeout,
            self.client.set_batch(entries, self.options.ttl),
        )
        .await
        {
            Ok(results) => results,
            Err(_) => batch
                .iter()
                .map(|_| Err(StoreError::Timeout(timeout)))
                .collect(),
        };

        let mut results = results.into_iter();
        for write in batch {
            let outcome = results
                .next()
                .unwrap_or_else(|| Err(StoreError::Connection("store returned no result".into())));
            match outcome {
                Ok(true) => {
                    debug!(
                        job_id = %report.job_id,
                        chunk = write.index,
                        key = %write.key,
                        size = write.value.len(),
                        "Chunk written"
                    );
                    report.bytes_written += write.value.len() as u64;
                    if let Some(m) = &self.metrics {
                        m.chunks_written.inc();
                        m.bytes_written.inc_by(write.value.len() as u64);
                    }
                    report.written.push(write.key);
                }
                Ok(false) => {
                    let error = StoreError::Rejected(write.key.clone());
                    self.record_failure(report, write, error);
                }
                Err(e) => self.record_failure(report, write, e),
            }
        }
    }

    fn record_failure(&self, report: &mut InsertionReport, write: PendingWrite, error: StoreError) {
        warn!(
            job_id = %report.job_id,
            chunk = write.index,
            key = %write.key,
            "Chunk write failed: {error}"
        );
        if let Some(m) = &self.metrics {
            m.chunks_failed.inc();
        }
        report.failed.push(FailedChunk {
            index: write.index,
            key: write.key,
            error,
        });
    }
}

/// Insert one sequence with default batching and timeout.
#[allow(clippy::too_many_arguments)]
pub async fn insert_sequence(
    client: SharedClient,
    tokens: &[TokenId],
    blob: &TensorBlob,
    chunk_size: usize,
    format: &str,
    model_id: &str,
    world_size: usize,
    worker_id: usize,
) -> Result<InsertionReport, InsertError> {
    let keys = KeyBuilder::new(format, model_id, world_size, worker_id)?;
    let options = InsertOptions {
        chunk_size,
        ..Default::default()
    };
    InsertionDriver::new(client, keys, options)
        .insert_sequence(tokens, blob, &CancelToken::new())
        .await
}
