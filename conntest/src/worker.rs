//! Probe workers and the pool running them
//!
//! Every worker owns an independent interval timer. Workers never share a
//! schedule, so their attempts drift apart naturally.

use crate::{config::WorkerConfig, probe::Probe};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use snat_common::{constants::SLOW_ATTEMPT_THRESHOLD_MS, Sample};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// What a worker did before it stopped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Attempts performed
    pub attempts: u64,
    /// Samples handed to the channel
    pub delivered: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.attempts += other.attempts;
        self.delivered += other.delivered;
    }
}

/// A task performing one attempt per tick
pub struct ProbeWorker<P> {
    id: usize,
    config: Arc<WorkerConfig>,
    probe: Arc<P>,
    samples: mpsc::Sender<Sample>,
}

impl<P: Probe> ProbeWorker<P> {
    /// Create a new probe worker
    ///
    /// # Arguments
    ///
    /// * `id` - Worker number used in log lines
    /// * `config` - Shared worker configuration
    /// * `probe` - Network operation to perform
    /// * `samples` - Egress channel towards the aggregator
    pub fn new(
        id: usize,
        config: Arc<WorkerConfig>,
        probe: Arc<P>,
        samples: mpsc::Sender<Sample>,
    ) -> Self {
        Self {
            id,
            config,
            probe,
            samples,
        }
    }

    /// Run until cancelled or until the channel closes
    ///
    /// The first attempt happens one dial interval after start. Ticks missed
    /// while an attempt or a send was pending are skipped.
    pub async fn run(self, cancel: CancellationToken) -> WorkerReport {
        let period = self.config.dial_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = WorkerReport::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sample = self.attempt().await;
            report.attempts += 1;

            match self.samples.try_send(sample) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(sample)) => {
                    // Block rather than drop, unless the run is stopping
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("worker {}: dropping last sample on shutdown", self.id);
                            break;
                        }
                        sent = self.samples.send(sample) => {
                            if sent.is_err() {
                                debug!("worker {}: sample channel closed", self.id);
                                break;
                            }
                            report.delivered += 1;
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("worker {}: sample channel closed", self.id);
                    break;
                }
            }
        }

        debug!(
            "worker {}: stopped after {} attempts",
            self.id, report.attempts
        );
        report
    }

    /// Perform one attempt bounded by the configured timeout
    async fn attempt(&self) -> Sample {
        let limit = self.config.timeout;
        let start = Instant::now();

        let result = match timeout(limit, self.probe.attempt()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {}ms", limit.as_millis())),
        };
        let elapsed = start.elapsed();

        match result {
            Err(e) => {
                let sample = Sample::failure(elapsed);
                warn!(
                    "worker {}: error after {}ms: {:#}",
                    self.id,
                    sample.elapsed_ms(),
                    e
                );
                sample
            }
            Ok(request_id) => {
                let sample = Sample::success(elapsed);
                if sample.elapsed_ms() > SLOW_ATTEMPT_THRESHOLD_MS {
                    match request_id {
                        Some(id) => warn!(
                            "worker {}: slow request {} {}ms on {}",
                            self.id,
                            id,
                            sample.elapsed_ms(),
                            self.probe.describe()
                        ),
                        None => warn!(
                            "worker {}: slow attempt {}ms on {}",
                            self.id,
                            sample.elapsed_ms(),
                            self.probe.describe()
                        ),
                    }
                }
                sample
            }
        }
    }
}

/// Fixed set of probe workers sharing one configuration and one channel
pub struct WorkerPool {
    workers: JoinSet<WorkerReport>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers
    ///
    /// The pool takes the only sender; once every worker has returned the
    /// channel closes.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of workers
    /// * `config` - Configuration shared by every worker
    /// * `probe` - Network operation shared by every worker
    /// * `samples` - Egress channel towards the aggregator
    /// * `cancel` - Token stopping every worker
    pub fn start<P: Probe>(
        size: usize,
        config: Arc<WorkerConfig>,
        probe: Arc<P>,
        samples: mpsc::Sender<Sample>,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            "Starting {} workers with a {}us interval on {}",
            size,
            config.dial_interval.as_micros(),
            probe.describe()
        );

        let mut workers = JoinSet::new();
        for id in 0..size {
            let worker = ProbeWorker::new(
                id,
                Arc::clone(&config),
                Arc::clone(&probe),
                samples.clone(),
            );
            workers.spawn(worker.run(cancel.clone()));
        }

        Self { workers, size }
    }

    /// Number of workers started
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait until every worker has returned
    ///
    /// # Returns
    ///
    /// Combined worker reports, or an error if a worker panicked
    pub async fn join(mut self) -> Result<WorkerReport> {
        let mut total = WorkerReport::default();
        let mut failure = None;

        while let Some(joined) = self.workers.join_next().await {
            match joined.context("Probe worker failed") {
                Ok(report) => total.merge(report),
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use std::{
        future::Future,
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    /// Probe taking a fixed time and failing on demand
    struct FakeProbe {
        delay: Duration,
        fail: bool,
        calls: AtomicU64,
    }

    impl FakeProbe {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail,
                calls: AtomicU64::new(0),
            })
        }
    }

    impl Probe for FakeProbe {
        fn attempt(&self) -> impl Future<Output = Result<Option<u64>>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, fail) = (self.delay, self.fail);
            async move {
                tokio::time::sleep(delay).await;
                if fail {
                    anyhow::bail!("connection refused");
                }
                Ok(Some(7))
            }
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    fn config(interval_ms: u64, timeout_ms: u64) -> Arc<WorkerConfig> {
        Arc::new(WorkerConfig {
            dial_interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            target: Target::Tcp("127.0.0.1:9".parse().unwrap()),
            local_ip: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_sample_per_tick() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let probe = FakeProbe::new(Duration::from_millis(3), false);
        let worker = ProbeWorker::new(0, config(100, 500), Arc::clone(&probe), tx);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.attempts, 10);
        assert_eq!(report.delivered, 10);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 10);

        let mut received = 0;
        while let Ok(sample) = rx.try_recv() {
            assert!(!sample.failed);
            assert!(sample.elapsed >= Duration::from_millis(3));
            received += 1;
        }
        assert_eq!(received, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_timeouts_become_samples() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let failing = ProbeWorker::new(
            0,
            config(100, 500),
            FakeProbe::new(Duration::from_millis(2), true),
            tx.clone(),
        );
        let hanging = ProbeWorker::new(
            1,
            config(1000, 50),
            FakeProbe::new(Duration::from_secs(60), false),
            tx,
        );
        let a = tokio::spawn(failing.run(cancel.clone()));
        let b = tokio::spawn(hanging.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1090)).await;
        cancel.cancel();
        let failing_report = a.await.unwrap();
        let hanging_report = b.await.unwrap();

        assert_eq!(failing_report.attempts, 10);
        assert_eq!(hanging_report.attempts, 1);

        let mut timed_out = 0;
        let mut failed = 0;
        while let Ok(sample) = rx.try_recv() {
            assert!(sample.failed);
            if sample.elapsed >= Duration::from_millis(50) {
                timed_out += 1;
            } else {
                assert!(sample.elapsed >= Duration::from_millis(2));
                failed += 1;
            }
        }
        assert_eq!(timed_out, 1);
        assert_eq!(failed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pool_within_bound() {
        let (tx, _rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let probe = FakeProbe::new(Duration::from_secs(10), false);
        let pool = WorkerPool::start(8, config(100, 500), probe, tx, cancel.clone());
        assert_eq!(pool.size(), 8);

        // Every worker is in the middle of an attempt
        tokio::time::sleep(Duration::from_millis(150)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();
        let report = pool.join().await.unwrap();

        assert!(cancelled_at.elapsed() <= Duration::from_millis(600));
        assert_eq!(report.attempts, 8);
        assert_eq!(report.delivered, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_block_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let probe = FakeProbe::new(Duration::ZERO, false);
        let pool = WorkerPool::start(2, config(100, 500), Arc::clone(&probe), tx, cancel.clone());

        // Nobody reads: four samples fill the channel, then both workers
        // block on their next send and stop attempting
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);

        // Draining lets them continue with the samples they held
        let mut received = 0u64;
        for _ in 0..6 {
            rx.recv().await.unwrap();
            received += 1;
        }

        cancel.cancel();
        let report = pool.join().await.unwrap();
        while rx.try_recv().is_ok() {
            received += 1;
        }

        assert_eq!(report.delivered, received);
        // At most one sample per worker is given up on shutdown
        assert!(report.attempts - report.delivered <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let worker = ProbeWorker::new(
            0,
            config(100, 500),
            FakeProbe::new(Duration::ZERO, false),
            tx,
        );

        let report = worker.run(CancellationToken::new()).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.delivered, 0);
    }
}
