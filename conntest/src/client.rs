//! Client run lifecycle
//!
//! Wires the worker pool, the sample channel and the aggregator together,
//! and stops them in order once the cancellation token fires: workers
//! first, then the aggregator.

use crate::{
    aggregator::Aggregator,
    collector::RunCounters,
    config::{ClientConfig, Target},
    exporter::{build_reporter, WindowReporter},
    probe::{HttpProbe, Probe, TcpProbe},
    types::CounterSnapshot,
    worker::{WorkerPool, WorkerReport},
};
use anyhow::{Context, Result};
use log::info;
use snat_common::constants::SAMPLE_CHANNEL_CAPACITY;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of a whole client run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Totals as counted by the aggregator
    pub totals: CounterSnapshot,
    /// Attempts and deliveries as seen by the workers
    pub workers: WorkerReport,
}

/// Run the client until `cancel` fires, reporting with the configured format
pub async fn run_client(config: ClientConfig, cancel: CancellationToken) -> Result<RunSummary> {
    let reporter = build_reporter(config.format, config.output.clone())?;
    run_client_with_reporter(config, reporter, cancel).await
}

/// Run the client until `cancel` fires
///
/// # Arguments
///
/// * `config` - Validated client configuration
/// * `reporter` - Receives every closed window
/// * `cancel` - Stops the run
pub async fn run_client_with_reporter(
    config: ClientConfig,
    reporter: Box<dyn WindowReporter + Send>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    match config.worker.target.clone() {
        Target::Tcp(remote) => {
            let probe = TcpProbe::new(remote, config.worker.local_ip);
            run_with_probe(probe, config, reporter, cancel).await
        }
        Target::Http(url) => {
            let probe = HttpProbe::new(url, config.worker.local_ip)?;
            run_with_probe(probe, config, reporter, cancel).await
        }
    }
}

async fn run_with_probe<P: Probe>(
    probe: P,
    config: ClientConfig,
    reporter: Box<dyn WindowReporter + Send>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
    let counters = Arc::new(RunCounters::new());

    let aggregator = Aggregator::new(config.summary_interval, Arc::clone(&counters), reporter)
        .flush_on_shutdown(config.flush_on_shutdown);
    let aggregator = tokio::spawn(aggregator.run(rx, cancel.clone()));

    let pool = WorkerPool::start(
        config.workers,
        Arc::new(config.worker),
        Arc::new(probe),
        tx,
        cancel.clone(),
    );

    cancel.cancelled().await;
    info!("Stopping...");

    let workers = pool.join().await?;
    info!("All {} workers stopped", config.workers);

    let totals = aggregator.await.context("Aggregator task failed")?;

    Ok(RunSummary { totals, workers })
}
