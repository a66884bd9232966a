//! Content-addressed KV cache chunks.
//!
//! This module contains the pure data-path pieces:
//! - [`hashing`]: prefix hash chain over token chunks
//! - [`codec`]: TensorBlob packing, token-axis slicing and byte layout
//! - [`chunker`]: fixed-size chunking with prefix hashes
//! - [`key`]: namespaced cache key strings

pub mod chunker;
pub mod codec;
pub mod hashing;
pub mod key;
