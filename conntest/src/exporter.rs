//! Window reporters
//!
//! Renders window reports as log text, JSON lines or a Prometheus textfile.

use crate::types::{as_millis_f64, WindowOutcome, WindowReport};
use anyhow::{Context, Result};
use log::info;
use std::{
    fs,
    io::Write,
    path::PathBuf,
};

/// Trait for window reporters
pub trait WindowReporter {
    /// Report one closed window
    ///
    /// # Arguments
    ///
    /// * `report` - Statistics of the window that just closed
    ///
    /// # Returns
    ///
    /// Result indicating success or failure
    fn report(&self, report: &WindowReport) -> Result<()>;
}

/// Report format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// Human readable lines through the logger
    Text,
    /// One JSON document per line on stdout
    Json,
    /// Prometheus text format file
    Prometheus,
}

impl ExporterType {
    /// Parse a format name
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            _ => anyhow::bail!(
                "Unsupported format: {}. Use text, json, or prometheus",
                format
            ),
        }
    }
}

/// Build the reporter for a format
///
/// # Arguments
///
/// * `kind` - Report format
/// * `output` - Output file, required by the Prometheus format
pub fn build_reporter(
    kind: ExporterType,
    output: Option<PathBuf>,
) -> Result<Box<dyn WindowReporter + Send>> {
    Ok(match kind {
        ExporterType::Text => Box::new(TextReporter),
        ExporterType::Json => Box::new(JsonReporter),
        ExporterType::Prometheus => {
            let path = output.context("The prometheus format needs an --output file")?;
            Box::new(PrometheusReporter::new(path))
        }
    })
}

/// Plain text reporter
pub struct TextReporter;

impl TextReporter {
    /// Render a report as text
    fn to_text_format(report: &WindowReport) -> String {
        let stats = match &report.outcome {
            WindowOutcome::NoData => {
                return "No request completed in the current time frame".to_string()
            }
            WindowOutcome::Stats(stats) => stats,
        };

        let mut output = String::new();
        output.push_str(&format!(
            "Summary of the last {} seconds:\n",
            report.period_secs
        ));
        output.push_str(&format!(
            "             Max response time: {:>5.1}ms\n",
            as_millis_f64(stats.max)
        ));
        output.push_str(&format!(
            "                 99 percentile: {:>5.1}ms\n",
            as_millis_f64(stats.p99)
        ));
        output.push_str(&format!(
            "                 95 percentile: {:>5.1}ms\n",
            as_millis_f64(stats.p95)
        ));
        output.push_str(&format!(
            "                        median: {:>5.1}ms\n",
            as_millis_f64(stats.median)
        ));
        output.push_str(&format!(
            "                       Average: {:>5.1}ms\n",
            as_millis_f64(stats.mean)
        ));
        output.push_str(&format!(
            "                  Request Rate: {:>5}req/s\n",
            stats.rate
        ));
        output.push_str(&format!(
            "Requests since start (error/total): {:>5}/{}",
            report.totals.total_errors, report.totals.total_attempts
        ));
        output
    }
}

impl WindowReporter for TextReporter {
    fn report(&self, report: &WindowReport) -> Result<()> {
        for line in Self::to_text_format(report).lines() {
            info!("{}", line);
        }
        Ok(())
    }
}

/// JSON lines reporter, one object per window on stdout
pub struct JsonReporter;

impl WindowReporter for JsonReporter {
    fn report(&self, report: &WindowReport) -> Result<()> {
        let json = serde_json::to_string(report)?;

        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", json).context("Failed to write report to stdout")?;
        stdout.flush().context("Failed to flush stdout")?;

        Ok(())
    }
}

/// Prometheus textfile reporter
///
/// Rewrites the whole file at every flush, so it only ever holds the latest
/// window.
pub struct PrometheusReporter {
    output_path: PathBuf,
}

impl PrometheusReporter {
    /// Create a new Prometheus reporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert a report to Prometheus format
    fn to_prometheus_format(report: &WindowReport) -> String {
        let mut output = String::new();

        // Run totals
        output.push_str("# HELP snat_conntest_attempts_total Attempts since start\n");
        output.push_str("# TYPE snat_conntest_attempts_total counter\n");
        output.push_str(&format!(
            "snat_conntest_attempts_total {}\n",
            report.totals.total_attempts
        ));
        output.push('\n');

        output.push_str("# HELP snat_conntest_errors_total Failed attempts since start\n");
        output.push_str("# TYPE snat_conntest_errors_total counter\n");
        output.push_str(&format!(
            "snat_conntest_errors_total {}\n",
            report.totals.total_errors
        ));
        output.push('\n');

        // Window size
        let (samples, errors, rate) = match &report.outcome {
            WindowOutcome::NoData => (0, 0, 0),
            WindowOutcome::Stats(stats) => (stats.samples, stats.errors, stats.rate),
        };
        output.push_str("# HELP snat_conntest_window_samples Samples in the last window\n");
        output.push_str("# TYPE snat_conntest_window_samples gauge\n");
        output.push_str(&format!("snat_conntest_window_samples {}\n", samples));
        output.push('\n');

        output.push_str("# HELP snat_conntest_window_errors Failed samples in the last window\n");
        output.push_str("# TYPE snat_conntest_window_errors gauge\n");
        output.push_str(&format!("snat_conntest_window_errors {}\n", errors));
        output.push('\n');

        output.push_str("# HELP snat_conntest_rate_per_second Attempts per second in the last window\n");
        output.push_str("# TYPE snat_conntest_rate_per_second gauge\n");
        output.push_str(&format!("snat_conntest_rate_per_second {}\n", rate));
        output.push('\n');

        // Percentiles are omitted for an empty window
        if let Some(stats) = report.stats() {
            output.push_str("# HELP snat_conntest_latency_milliseconds Attempt latency in the last window\n");
            output.push_str("# TYPE snat_conntest_latency_milliseconds gauge\n");
            for (quantile, value) in [
                ("0.5", stats.median),
                ("0.95", stats.p95),
                ("0.99", stats.p99),
                ("1", stats.max),
            ] {
                output.push_str(&format!(
                    "snat_conntest_latency_milliseconds{{quantile=\"{}\"}} {}\n",
                    quantile,
                    as_millis_f64(value)
                ));
            }
            output.push('\n');
        }

        output
    }

    /// Temporary path next to the output file
    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .output_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.output_path.with_file_name(name)
    }
}

impl WindowReporter for PrometheusReporter {
    fn report(&self, report: &WindowReport) -> Result<()> {
        let prometheus_data = Self::to_prometheus_format(report);
        let temp_path = self.temp_path();

        fs::write(&temp_path, prometheus_data.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", temp_path))?;
        fs::rename(&temp_path, &self.output_path)
            .with_context(|| format!("Failed to replace output file: {:?}", self.output_path))?;

        Ok(())
    }
}
