//! Prometheus counters for insertion and lookup jobs.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub sequences_inserted: IntCounter,
    pub chunks_written: IntCounter,
    pub chunks_failed: IntCounter,
    pub bytes_written: IntCounter,
    pub lookup_hits: IntCounter,
    pub lookup_misses: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("kv_chunk_cache".to_string()), None)?;

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        Ok(Self {
            sequences_inserted: counter("sequences_inserted_total", "Sequences processed by the insertion driver")?,
            chunks_written: counter("chunks_written_total", "Chunk writes acknowledged by the store")?,
            chunks_failed: counter("chunks_failed_total", "Chunk writes that failed or timed out")?,
            bytes_written: counter("bytes_written_total", "Chunk payload bytes written")?,
            lookup_hits: counter("lookup_hit_chunks_total", "Chunks found during prefix lookup")?,
            lookup_misses: counter("lookup_misses_total", "Prefix lookups that stopped on a missing chunk")?,
            registry,
        })
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new().unwrap();
        metrics.chunks_written.inc_by(3);
        let text = metrics.encode().unwrap();
        assert!(text.contains("kv_chunk_cache_chunks_written_total 3"));
    }
}
