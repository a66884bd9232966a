//! kv-chunk-cache: content-addressed KV cache chunks in an external store.
//!
//! A token sequence and its per-layer attention tensors are split into
//! fixed-size chunks. Each chunk is keyed by a hash chain over its full token
//! prefix, so identical prefixes map to identical keys across requests:
//!
//!   tokens + tensors → pack → chunk + prefix hash → key → store
//!
//! Any store exposing get/set/exists can back the cache.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod store;
pub mod synth;
