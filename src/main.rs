//! kv-chunk-cache: synthetic KV cache insertion workload.
//!
//! Generates random token sequences and per-layer KV tensors, chunks them by
//! prefix hash and writes every chunk to the configured store. Several
//! workers may share one store connection. Ctrl-C cancels at the next chunk
//! boundary.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

use kv_chunk_cache::cache::codec::pack;
use kv_chunk_cache::cache::key::KeyBuilder;
use kv_chunk_cache::config::{Cli, Config};
use kv_chunk_cache::metrics::Metrics;
use kv_chunk_cache::pipeline::cancel::CancelToken;
use kv_chunk_cache::pipeline::insert::{InsertOptions, InsertionDriver};
use kv_chunk_cache::pipeline::lookup::Lookup;
use kv_chunk_cache::store::{self, SharedClient};
use kv_chunk_cache::synth::{generate_kv_cache, generate_tokens};

/// Totals reported by one worker.
#[derive(Debug, Default)]
struct WorkerSummary {
    sequences: usize,
    chunks_written: usize,
    chunks_failed: usize,
    bytes_written: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_chunk_cache=debug"
    } else {
        "kv_chunk_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-chunk-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_id,
        layout = %config.model.layout,
        layers = config.model.num_layers,
        chunk_size = config.chunking.chunk_size,
        chunk_bytes = config.chunk_bytes(),
        world_size = config.topology.world_size,
        worker_id = config.topology.worker_id,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping at the next chunk boundary");
                cancel.cancel();
            }
        });
    }

    let seed = config.workload.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    });
    info!(seed, workers = config.workload.workers, "Starting workload");

    let client = store::connect(&config.store)
        .await
        .context("connecting to store")?;

    let started = Instant::now();
    let summaries = store::with_session(client, |client| {
        run_workers(client, config.clone(), metrics.clone(), cancel.clone(), seed, cli.lookup)
    })
    .await?;

    let total = summaries.iter().fold(WorkerSummary::default(), |mut acc, s| {
        acc.sequences += s.sequences;
        acc.chunks_written += s.chunks_written;
        acc.chunks_failed += s.chunks_failed;
        acc.bytes_written += s.bytes_written;
        acc
    });

    info!(
        sequences = total.sequences,
        chunks_written = total.chunks_written,
        chunks_failed = total.chunks_failed,
        bytes_written = total.bytes_written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        cancelled = cancel.is_cancelled(),
        "Workload complete"
    );

    if cli.metrics {
        print!("{}", metrics.encode()?);
    }

    Ok(())
}

/// Spawn one task per worker on the shared client and wait for all of them.
async fn run_workers(
    client: SharedClient,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    cancel: CancelToken,
    seed: u64,
    lookup: bool,
) -> anyhow::Result<Vec<WorkerSummary>> {
    let mut handles = Vec::with_capacity(config.workload.workers);
    for worker in 0..config.workload.workers {
        let client = client.clone();
        let config = config.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_worker(worker, client, config, metrics, cancel, seed.wrapping_add(worker as u64), lookup).await
        }));
    }

    collect_summaries(futures::future::join_all(handles).await)
}

/// Gather worker results. Any failed worker fails the run.
fn collect_summaries(
    results: Vec<Result<anyhow::Result<WorkerSummary>, tokio::task::JoinError>>,
) -> anyhow::Result<Vec<WorkerSummary>> {
    let total = results.len();
    let mut summaries = Vec::with_capacity(total);
    let mut failed = 0;
    for (worker, joined) in results.into_iter().enumerate() {
        match joined? {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                error!(worker, "Worker failed: {e:#}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {total} workers failed");
    }
    Ok(summaries)
}

async fn run_worker(
    worker: usize,
    client: SharedClient,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    cancel: CancelToken,
    seed: u64,
    lookup: bool,
) -> anyhow::Result<WorkerSummary> {
    let layout = config.model.layout;
    let keys = KeyBuilder::new(
        layout.tag(),
        config.model.model_id.clone(),
        config.topology.world_size,
        config.topology.worker_id,
    )?;
    let options = InsertOptions::from_config(&config);
    let driver = InsertionDriver::new(client.clone(), keys.clone(), options.clone())
        .with_metrics(metrics.clone());
    let reader = Lookup::new(client, keys, options.chunk_size, options.op_timeout)
        .with_metrics(metrics);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut summary = WorkerSummary::default();

    for iteration in 0..config.workload.iterations {
        if cancel.is_cancelled() {
            break;
        }

        let tokens = generate_tokens(&mut rng, config.workload.num_tokens);
        let layers = generate_kv_cache(&mut rng, tokens.len(), &config.model, layout)?;
        let blob = pack(&layers, layout)?;
        drop(layers);

        let report = driver.insert_sequence(&tokens, &blob, &cancel).await?;
        summary.sequences += 1;
        summary.chunks_written += report.written_count();
        summary.chunks_failed += report.failed.len();
        summary.bytes_written += report.bytes_written;

        info!(
            worker,
            iteration,
            job_id = %report.job_id,
            written = report.written_count(),
            failed = report.failed.len(),
            "Iteration done"
        );

        if lookup && !report.cancelled {
            let cached = reader.cached_prefix_len(&tokens).await?;
            let expected = report.total_chunks * options.chunk_size;
            if cached < expected && report.failed.is_empty() {
                warn!(worker, iteration, cached, expected, "Cached prefix shorter than inserted");
            } else {
                info!(worker, iteration, cached, "Prefix lookup");
            }
        }
    }

    Ok(summary)
}
