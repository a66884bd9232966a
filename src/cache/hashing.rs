//! Prefix hashing for token chunks.
//!
//! Each chunk is identified by a chain hash: SHA-256 over the previous chunk's
//! hex digest followed by the chunk's token ids. The digest of chunk `i` thus
//! depends on every token in chunks `0..=i`, so two sequences share hashes
//! exactly as long as they share a chunk-aligned token prefix.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Token id as produced by the tokenizer.
pub type TokenId = i32;

/// Hex digest identifying a chunk by its full token history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixHash(String);

impl PrefixHash {
    /// The lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrefixHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PrefixHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash one chunk given the digest of the chunk before it.
///
/// `previous_digest` is the empty string for the first chunk. Tokens are fed
/// as 4-byte little-endian integers in sequence order.
pub fn chain_hash(chunk_tokens: &[TokenId], previous_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_digest.as_bytes());
    for t in chunk_tokens {
        hasher.update(t.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Running state of a prefix hash chain.
///
/// Fold chunks in with [`HashChain::advance`] in sequence order; each call
/// returns the prefix hash of the chunk just added.
#[derive(Debug, Clone, Default)]
pub struct HashChain {
    digest: String,
    chunks: usize,
}

impl HashChain {
    /// An empty chain, positioned before the first chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the next chunk into the chain.
    pub fn advance(&mut self, chunk_tokens: &[TokenId]) -> PrefixHash {
        self.digest = chain_hash(chunk_tokens, &self.digest);
        self.chunks += 1;
        PrefixHash(self.digest.clone())
    }

    /// Digest of the last chunk folded in (empty before the first).
    pub fn current(&self) -> &str {
        &self.digest
    }

    /// Number of chunks folded in so far.
    pub fn len(&self) -> usize {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

/// Prefix hashes for an ordered series of chunks.
pub fn prefix_hashes<'a, I>(chunks: I) -> Vec<PrefixHash>
where
    I: IntoIterator<Item = &'a [TokenId]>,
{
    let mut chain = HashChain::new();
    chunks.into_iter().map(|c| chain.advance(c)).collect()
}
