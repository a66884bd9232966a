//! Cache key construction.
//!
//! Keys have the form `<format>:<model_id>:<world_size>:<worker_id>:<prefix_hash>`.
//! Fields are not escaped, so none of them may contain `:`.

use std::fmt;

use thiserror::Error;

use crate::cache::hashing::PrefixHash;

const DELIMITER: char = ':';

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Key field '{field}' contains ':' ({value})")]
    ContainsDelimiter { field: &'static str, value: String },

    #[error("Malformed cache key: {0}")]
    Malformed(String),
}

/// Build the cache key for one chunk.
pub fn build_key(
    format: &str,
    model_id: &str,
    world_size: usize,
    worker_id: usize,
    prefix_hash: &str,
) -> Result<String, KeyError> {
    if format.is_empty() {
        return Err(KeyError::EmptyField("format"));
    }
    if prefix_hash.is_empty() {
        return Err(KeyError::EmptyField("prefix_hash"));
    }
    for (field, value) in [
        ("format", format),
        ("model_id", model_id),
        ("prefix_hash", prefix_hash),
    ] {
        if value.contains(DELIMITER) {
            return Err(KeyError::ContainsDelimiter {
                field,
                value: value.to_string(),
            });
        }
    }
    Ok(format!("{format}:{model_id}:{world_size}:{worker_id}:{prefix_hash}"))
}

/// The fields of a parsed cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub format: String,
    pub model_id: String,
    pub world_size: usize,
    pub worker_id: usize,
    pub prefix_hash: String,
}

impl CacheKey {
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let malformed = || KeyError::Malformed(key.to_string());
        let parts: Vec<&str> = key.split(DELIMITER).collect();
        let [format, model_id, world_size, worker_id, prefix_hash] = parts[..] else {
            return Err(malformed());
        };
        if format.is_empty() || prefix_hash.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            format: format.to_string(),
            model_id: model_id.to_string(),
            world_size: world_size.parse().map_err(|_| malformed())?,
            worker_id: worker_id.parse().map_err(|_| malformed())?,
            prefix_hash: prefix_hash.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.format, self.model_id, self.world_size, self.worker_id, self.prefix_hash
        )
    }
}

/// Builds keys for one model and deployment topology.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    format: String,
    model_id: String,
    world_size: usize,
    worker_id: usize,
}

impl KeyBuilder {
    /// Validates the fixed fields once so per-chunk key building cannot fail.
    pub fn new(
        format: impl Into<String>,
        model_id: impl Into<String>,
        world_size: usize,
        worker_id: usize,
    ) -> Result<Self, KeyError> {
        let format = format.into();
        let model_id = model_id.into();
        // A placeholder hash exercises the same checks as a real key.
        build_key(&format, &model_id, world_size, worker_id, "0")?;
        Ok(Self {
            format,
            model_id,
            world_size,
            worker_id,
        })
    }

    /// Key for a chunk with the given prefix hash.
    pub fn key_for(&self, hash: &PrefixHash) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.format, self.model_id, self.world_size, self.worker_id, hash
        )
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}
