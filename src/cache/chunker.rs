//! Splits a token sequence and its packed KV blob into fixed-size chunks.
//!
//! Only whole chunks are produced. When the sequence length is not a multiple
//! of the chunk size, the trailing tokens and their tensor slice are dropped:
//! partial chunks are never cached.

use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use crate::cache::codec::TensorBlob;
use crate::cache::hashing::{HashChain, PrefixHash, TokenId};

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("Token count {tokens} does not match tensor token axis {tensor_tokens}")]
    LengthMismatch { tokens: usize, tensor_tokens: usize },
}

/// One cacheable chunk: its tokens, prefix hash and tensor slice.
#[derive(Debug, Clone)]
pub struct Chunk<'a> {
    /// Position of the chunk in the sequence.
    pub index: usize,

    /// Token positions covered.
    pub token_range: Range<usize>,

    pub tokens: &'a [TokenId],

    pub prefix_hash: PrefixHash,

    /// KV slice for `token_range`.
    pub kv: TensorBlob,
}

/// Lazy iterator over the chunks of one sequence.
///
/// Holds the running hash chain, so it can be consumed once. Chunk again with
/// a fresh [`chunk`] call to start over.
#[derive(Debug)]
pub struct Chunks<'a> {
    tokens: &'a [TokenId],
    blob: &'a TensorBlob,
    chunk_size: usize,
    num_chunks: usize,
    next: usize,
    chain: HashChain,
}

/// Prepare to chunk `tokens` and its aligned `blob`.
///
/// The blob's token axis must already match `tokens.len()`. The token count
/// then decides the truncation boundary for both.
pub fn chunk<'a>(
    tokens: &'a [TokenId],
    blob: &'a TensorBlob,
    chunk_size: usize,
) -> Result<Chunks<'a>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    if blob.num_tokens() != tokens.len() {
        return Err(ChunkError::LengthMismatch {
            tokens: tokens.len(),
            tensor_tokens: blob.num_tokens(),
        });
    }

    let num_chunks = tokens.len() / chunk_size;
    debug!(
        tokens = tokens.len(),
        chunk_size,
        num_chunks,
        dropped = tokens.len() % chunk_size,
        layout = %blob.layout(),
        "Chunking sequence"
    );

    Ok(Chunks {
        tokens,
        blob,
        chunk_size,
        num_chunks,
        next: 0,
        chain: HashChain::new(),
    })
}

impl<'a> Chunks<'a> {
    /// Total number of chunks this pass yields.
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// Trailing tokens that do not fill a chunk.
    pub fn dropped_tokens(&self) -> usize {
        self.tokens.len() - self.num_chunks * self.chunk_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn produce(&mut self, index: usize) -> Chunk<'a> {
        let token_range = index * self.chunk_size..(index + 1) * self.chunk_size;
        let tokens = &self.tokens[token_range.clone()];
        let prefix_hash = self.chain.advance(tokens);
        // In bounds: the blob's token axis was checked against `tokens` in `chunk`.
        let kv = self.blob.take_tokens(token_range.clone());
        Chunk {
            index,
            token_range,
            tokens,
            prefix_hash,
            kv,
        }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.num_chunks {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.produce(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_chunks - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Prefix hashes of every whole chunk of `tokens`, without touching tensors.
pub fn chunk_hashes(tokens: &[TokenId], chunk_size: usize) -> Result<Vec<PrefixHash>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    let mut chain = HashChain::new();
    Ok(tokens
        .chunks_exact(chunk_size)
        .map(|c| chain.advance(c))
        .collect())
}
