//! Runtime configuration for kv-chunk-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Model shape, chunking, deployment topology, store and workload knobs all
//! live here; CLI flags override individual values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::codec::{BlobShape, KvLayout};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-chunk-cache",
    about = "Insert prefix-hashed KV cache chunks into a key-value store"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Number of sequences to insert per worker.
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Tokens per synthetic sequence.
    #[arg(long)]
    pub num_tokens: Option<usize>,

    /// Tokens per cached chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Concurrent insertion workers sharing one store.
    #[arg(long)]
    pub workers: Option<usize>,

    /// RNG seed for synthetic data (defaults to the clock).
    #[arg(long)]
    pub seed: Option<u64>,

    /// After inserting, look each sequence up again.
    #[arg(long)]
    pub lookup: bool,

    /// Print metrics in Prometheus text format on exit.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model shape and identity.
    pub model: ModelConfig,

    /// Chunking settings.
    pub chunking: ChunkingConfig,

    /// Deployment topology, part of every cache key.
    pub topology: TopologyConfig,

    /// Key-value store settings.
    pub store: StoreConfig,

    /// Synthetic insertion workload.
    pub workload: WorkloadConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier embedded in cache keys.
    pub model_id: String,

    /// Number of transformer layers.
    pub num_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub num_kv_heads: usize,

    /// Head dimension.
    pub head_size: usize,

    /// Tensor layout, also the cache key format tag.
    pub layout: KvLayout,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Llama 3 70B
        Self {
            model_id: "llama3-70B".to_string(),
            num_layers: 80,
            num_kv_heads: 8,
            head_size: 128,
            layout: KvLayout::Vllm,
        }
    }
}

impl ModelConfig {
    /// Metadata needed to decode this model's chunk blobs.
    pub fn blob_shape(&self) -> BlobShape {
        BlobShape {
            layout: self.layout,
            dtype: self.layout.default_dtype(),
            num_layers: self.num_layers,
            num_heads: self.num_kv_heads,
            head_size: self.head_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Tokens per chunk. Trailing partial chunks are never cached.
    pub chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub world_size: usize,
    pub worker_id: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            worker_id: 0,
        }
    }
}

/// Which store implementation to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Root directory for the disk backend.
    pub path: PathBuf,

    /// Apply zstd compression to values on disk.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Upper bound for a single store call (or pipelined batch), in milliseconds.
    pub op_timeout_ms: u64,

    /// Expiry applied to written chunks, in seconds. `None` keeps them forever.
    pub ttl_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Disk,
            path: PathBuf::from("/tmp/kv-chunk-cache"),
            zstd_compression: false,
            zstd_level: 3,
            op_timeout_ms: 5_000,
            ttl_secs: None,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Sequences inserted per worker.
    pub iterations: usize,

    /// Tokens per synthetic sequence.
    pub num_tokens: usize,

    /// Concurrent workers.
    pub workers: usize,

    /// Chunks written per pipelined batch.
    pub batch_size: usize,

    /// RNG seed; `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            num_tokens: 5120,
            workers: 1,
            batch_size: 8,
            seed: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(n) = cli.iterations {
            self.workload.iterations = n;
        }
        if let Some(n) = cli.num_tokens {
            self.workload.num_tokens = n;
        }
        if let Some(n) = cli.chunk_size {
            self.chunking.chunk_size = n;
        }
        if let Some(n) = cli.workers {
            self.workload.workers = n;
        }
        if cli.seed.is_some() {
            self.workload.seed = cli.seed;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be greater than zero");
        }
        if self.workload.batch_size == 0 {
            bail!("workload.batch_size must be greater than zero");
        }
        if self.workload.workers == 0 {
            bail!("workload.workers must be greater than zero");
        }
        if self.model.model_id.contains(':') {
            bail!("model.model_id must not contain ':'");
        }
        if self.topology.worker_id >= self.topology.world_size {
            bail!(
                "topology.worker_id {} out of range for world_size {}",
                self.topology.worker_id,
                self.topology.world_size
            );
        }
        Ok(())
    }

    /// Bytes of one chunk blob (both K and V, all layers).
    pub fn chunk_bytes(&self) -> usize {
        self.model.blob_shape().bytes_for(self.chunking.chunk_size)
    }
}
