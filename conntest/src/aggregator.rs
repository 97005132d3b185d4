//! Sample aggregation loop
//!
//! A single task drains the sample channel into the current window and
//! reports window statistics on its own timer.

use crate::{
    collector::{RunCounters, WindowCollector},
    exporter::WindowReporter,
    types::CounterSnapshot,
};
use log::{debug, error, info};
use snat_common::Sample;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Consumer of every sample produced by the worker pool
pub struct Aggregator {
    collector: WindowCollector,
    summary_interval: Duration,
    reporter: Box<dyn WindowReporter + Send>,
    flush_on_shutdown: bool,
}

impl Aggregator {
    /// Create a new aggregator
    ///
    /// # Arguments
    ///
    /// * `summary_interval` - Window length, in whole seconds
    /// * `counters` - Run-scoped totals
    /// * `reporter` - Receives every closed window
    pub fn new(
        summary_interval: Duration,
        counters: Arc<RunCounters>,
        reporter: Box<dyn WindowReporter + Send>,
    ) -> Self {
        Self {
            collector: WindowCollector::new(summary_interval, counters),
            summary_interval,
            reporter,
            flush_on_shutdown: false,
        }
    }

    /// Report the partial window when stopping
    ///
    /// The aggregator then keeps receiving until every worker has returned.
    pub fn flush_on_shutdown(mut self, enabled: bool) -> Self {
        self.flush_on_shutdown = enabled;
        self
    }

    /// Run until cancelled or until every sender is gone
    ///
    /// Waits on whichever comes first of a sample, the flush timer and the
    /// cancellation token.
    ///
    /// # Returns
    ///
    /// Run-scoped totals at the time the aggregator stopped
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<Sample>,
        cancel: CancellationToken,
    ) -> CounterSnapshot {
        let start = Instant::now() + self.summary_interval;
        let mut ticker = interval_at(start, self.summary_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Recording");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Aggregator cancelled");
                    break;
                }
                received = samples.recv() => match received {
                    Some(sample) => self.collector.add_sample(sample),
                    None => {
                        debug!("Sample channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush(),
            }
        }

        if self.flush_on_shutdown {
            // The pool holds every sender; the channel ends once the last
            // worker has returned, in-flight attempts included
            while let Some(sample) = samples.recv().await {
                self.collector.add_sample(sample);
            }
            if !self.collector.window().is_empty() {
                info!("Reporting partial window");
                self.flush();
            }
        } else if !self.collector.window().is_empty() {
            debug!(
                "Discarding {} samples of the partial window",
                self.collector.window().len()
            );
        }

        self.collector.counters().snapshot()
    }

    /// Close the current window and hand it to the reporter
    fn flush(&mut self) {
        let report = self.collector.flush();
        if let Err(e) = self.reporter.report(&report) {
            error!("Failed to report window statistics: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Target, WorkerConfig},
        probe::Probe,
        types::{WindowOutcome, WindowReport},
        worker::WorkerPool,
    };
    use anyhow::Result;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct CaptureReporter {
        reports: Arc<Mutex<Vec<WindowReport>>>,
    }

    impl CaptureReporter {
        fn reports(&self) -> Vec<WindowReport> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl WindowReporter for CaptureReporter {
        fn report(&self, report: &WindowReport) -> Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct FailingReporter;

    impl WindowReporter for FailingReporter {
        fn report(&self, _report: &WindowReport) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn spawn_aggregator(
        reporter: Box<dyn WindowReporter + Send>,
        flush_on_shutdown: bool,
    ) -> (
        mpsc::Sender<Sample>,
        CancellationToken,
        Arc<RunCounters>,
        tokio::task::JoinHandle<CounterSnapshot>,
    ) {
        let (tx, rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let counters = Arc::new(RunCounters::new());
        let aggregator = Aggregator::new(Duration::from_secs(1), Arc::clone(&counters), reporter)
            .flush_on_shutdown(flush_on_shutdown);
        let handle = tokio::spawn(aggregator.run(rx, cancel.clone()));
        (tx, cancel, counters, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reports_window_statistics() {
        let capture = CaptureReporter::default();
        let (tx, cancel, _counters, handle) = spawn_aggregator(Box::new(capture.clone()), false);

        for value in [4, 1, 3, 2] {
            tx.send(Sample::success(ms(value))).await.unwrap();
        }
        tx.send(Sample::failure(ms(5))).await.unwrap();

        tokio::time::sleep(ms(1500)).await;
        let reports = capture.reports();
        assert_eq!(reports.len(), 1);

        let stats = reports[0].stats().unwrap();
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.max, ms(5));
        assert_eq!(stats.p99, ms(4));
        assert_eq!(stats.median, ms(3));
        assert_eq!(stats.rate, 5);
        assert_eq!(reports[0].totals.total_attempts, 5);
        assert_eq!(reports[0].totals.total_errors, 1);

        cancel.cancel();
        let totals = handle.await.unwrap();
        assert_eq!(totals.total_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_reports_no_data() {
        let capture = CaptureReporter::default();
        let (tx, cancel, _counters, handle) = spawn_aggregator(Box::new(capture.clone()), false);

        tx.send(Sample::failure(ms(1))).await.unwrap();
        tokio::time::sleep(ms(2500)).await;

        let reports = capture.reports();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, WindowOutcome::Stats(_)));
        assert_eq!(reports[1].outcome, WindowOutcome::NoData);
        // Totals survive the empty window
        assert_eq!(reports[1].totals.total_attempts, 1);
        assert_eq!(reports[1].totals.total_errors, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_never_decrease() {
        let capture = CaptureReporter::default();
        let (tx, cancel, counters, handle) = spawn_aggregator(Box::new(capture.clone()), false);

        for round in 0..5u64 {
            for i in 0..round {
                tx.send(Sample {
                    elapsed: ms(i),
                    failed: i % 2 == 0,
                })
                .await
                .unwrap();
            }
            tokio::time::sleep(ms(1000)).await;
        }

        let reports = capture.reports();
        assert!(reports.len() >= 4);
        for pair in reports.windows(2) {
            assert!(pair[1].totals.total_attempts >= pair[0].totals.total_attempts);
            assert!(pair[1].totals.total_errors >= pair[0].totals.total_errors);
        }
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_attempts, 10);
        assert!(snapshot.total_attempts >= snapshot.total_errors);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_window_discarded_by_default() {
        let capture = CaptureReporter::default();
        let (tx, cancel, _counters, handle) = spawn_aggregator(Box::new(capture.clone()), false);

        tx.send(Sample::success(ms(1))).await.unwrap();
        tokio::time::sleep(ms(500)).await;
        cancel.cancel();
        let totals = handle.await.unwrap();

        assert!(capture.reports().is_empty());
        assert_eq!(totals.total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_window_flushed_on_shutdown() {
        let capture = CaptureReporter::default();
        let (tx, cancel, _counters, handle) = spawn_aggregator(Box::new(capture.clone()), true);

        tx.send(Sample::success(ms(1))).await.unwrap();
        tx.send(Sample::success(ms(2))).await.unwrap();
        cancel.cancel();

        // Still accepted after cancellation, until the last sender is gone
        tx.send(Sample::success(ms(3))).await.unwrap();
        drop(tx);
        let totals = handle.await.unwrap();

        let reports = capture.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stats().unwrap().samples, 3);
        assert_eq!(totals.total_attempts, 3);
    }

    /// Probe that takes a fixed time and always succeeds
    struct SleepProbe(Duration);

    impl Probe for SleepProbe {
        async fn attempt(&self) -> Result<Option<u64>> {
            tokio::time::sleep(self.0).await;
            Ok(None)
        }

        fn describe(&self) -> String {
            "sleep".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_in_flight_at_shutdown_are_reported() {
        let (tx, rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let counters = Arc::new(RunCounters::new());
        let capture = CaptureReporter::default();
        let aggregator = Aggregator::new(
            Duration::from_secs(1),
            Arc::clone(&counters),
            Box::new(capture.clone()),
        )
        .flush_on_shutdown(true);
        let aggregator = tokio::spawn(aggregator.run(rx, cancel.clone()));

        let config = Arc::new(WorkerConfig {
            dial_interval: ms(100),
            timeout: ms(500),
            target: Target::Tcp("127.0.0.1:9".parse().unwrap()),
            local_ip: None,
        });
        let pool = WorkerPool::start(4, config, Arc::new(SleepProbe(ms(200))), tx, cancel.clone());

        // Every worker is halfway through its first attempt
        tokio::time::sleep(ms(150)).await;
        cancel.cancel();
        let workers = pool.join().await.unwrap();
        let totals = aggregator.await.unwrap();

        assert_eq!(workers.attempts, 4);
        assert_eq!(workers.delivered, 4);
        assert_eq!(totals.total_attempts, workers.attempts);

        let reports = capture.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stats().unwrap().samples, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_senders_are_gone() {
        let capture = CaptureReporter::default();
        let (tx, _cancel, _counters, handle) = spawn_aggregator(Box::new(capture.clone()), false);

        tx.send(Sample::success(ms(1))).await.unwrap();
        drop(tx);

        let totals = handle.await.unwrap();
        assert_eq!(totals.total_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_errors_are_not_fatal() {
        let (tx, cancel, counters, handle) = spawn_aggregator(Box::new(FailingReporter), false);

        tx.send(Sample::success(ms(1))).await.unwrap();
        tokio::time::sleep(ms(1500)).await;
        tx.send(Sample::success(ms(1))).await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(counters.snapshot().total_attempts, 2);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }
}
