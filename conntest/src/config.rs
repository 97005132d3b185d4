//! Command line configuration
//!
//! Raw arguments (flags or environment variables) are validated here and
//! turned into typed configuration before any worker or listener starts.

use crate::exporter::ExporterType;
use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use log::warn;
use reqwest::Url;
use snat_common::constants::*;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Default worker count: one per CPU core
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Arguments of the `client` command
#[derive(Args, Debug, Clone)]
#[clap(group(ArgGroup::new("target").required(true).args(["remote_addr", "url"])))]
pub struct ClientArgs {
    /// Remote address (<host>:<port>) to connect to
    #[clap(short, long, env = "REMOTE_ADDR")]
    pub remote_addr: Option<String>,

    /// URL to send GET requests to, instead of raw TCP connections
    #[clap(short, long, env = "URL")]
    pub url: Option<String>,

    /// Local IP to connect from
    #[clap(short, long, env = "LOCAL_IP")]
    pub local_ip: Option<String>,

    /// Number of workers to start, by default the number of CPU cores
    #[clap(short = 'c', long, env = "WORKERS", default_value_t = default_workers())]
    pub workers: usize,

    /// Interval between two attempts of one worker, in microseconds
    #[clap(short, long, env = "DIAL_INTERVAL_US", default_value_t = DEFAULT_DIAL_INTERVAL_US)]
    pub dial_interval_us: u64,

    /// Attempt timeout in milliseconds. Should be less than a second
    #[clap(short, long, env = "TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Interval between two statistics summaries, in seconds
    #[clap(short, long, env = "SUMMARY_INTERVAL_S", default_value_t = DEFAULT_SUMMARY_INTERVAL_SECS)]
    pub summary_interval_sec: u64,

    /// Summary format (text, json, prometheus)
    #[clap(short, long, env = "REPORT_FORMAT", default_value = "text")]
    pub format: String,

    /// Output file, required by the prometheus format
    #[clap(short, long, env = "REPORT_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Report the partial window when stopping
    #[clap(long, env = "FLUSH_ON_SHUTDOWN")]
    pub flush_on_shutdown: bool,
}

/// Arguments of the `server` command
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Local address (<host>:<port>) to listen at
    #[clap(short = 'a', long, env = "LOCAL_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub local_addr: String,

    /// Number of accept loops, by default the number of CPU cores
    #[clap(short = 'c', long, env = "WORKERS", default_value_t = default_workers())]
    pub workers: usize,

    /// Answer every connection with a minimal HTTP response
    #[clap(long, env = "HTTP_RESPONSES")]
    pub http: bool,
}

/// What the workers probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Raw TCP connect and close
    Tcp(SocketAddr),
    /// HTTP GET
    Http(Url),
}

/// Settings shared read-only by every worker of a pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between two attempts of one worker
    pub dial_interval: Duration,
    /// Upper bound of one attempt
    pub timeout: Duration,
    /// Probe target
    pub target: Target,
    /// Source IP, kernel-chosen when absent
    pub local_ip: Option<IpAddr>,
}

/// Validated `client` configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of probe workers
    pub workers: usize,
    /// Shared worker settings
    pub worker: WorkerConfig,
    /// Window length
    pub summary_interval: Duration,
    /// Report format
    pub format: ExporterType,
    /// Report output file
    pub output: Option<PathBuf>,
    /// Report the partial window when stopping
    pub flush_on_shutdown: bool,
}

/// Validated `server` configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen at
    pub listen_addr: SocketAddr,
    /// Number of accept loops
    pub workers: usize,
    /// Answer with a minimal HTTP response before closing
    pub http: bool,
}

/// Parse the optional local IP; an empty string means none
pub fn parse_local_ip(raw: Option<&str>) -> Result<Option<IpAddr>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(ip) => ip
            .parse()
            .map(Some)
            .with_context(|| format!("unable to parse local IP: {:?}", ip)),
    }
}

/// Resolve `<host>:<port>` to the first address of the wanted family
///
/// # Arguments
///
/// * `raw` - Address as given by the operator
/// * `local_ip` - Source IP; the remote must share its family
pub async fn resolve_remote(raw: &str, local_ip: Option<IpAddr>) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(raw)
        .await
        .with_context(|| format!("unable to resolve remote address: {:?}", raw))?
        .collect();

    candidates
        .iter()
        .copied()
        .find(|addr| local_ip.map_or(true, |ip| ip.is_ipv4() == addr.is_ipv4()))
        .with_context(|| match local_ip {
            Some(ip) => format!("no address of {:?} matches the family of local IP {}", raw, ip),
            None => format!("no address found for {:?}", raw),
        })
}

fn non_zero(value: u64, name: &str) -> Result<u64> {
    if value == 0 {
        anyhow::bail!("{} must be >= 1", name);
    }
    Ok(value)
}

impl ClientArgs {
    /// Validate the arguments
    pub async fn into_config(self) -> Result<ClientConfig> {
        if self.workers == 0 {
            anyhow::bail!("Worker count must be >= 1");
        }
        let dial_interval_us = non_zero(self.dial_interval_us, "Dial interval")?;
        let timeout_ms = non_zero(self.timeout_ms, "Timeout")?;
        let summary_interval_sec = non_zero(self.summary_interval_sec, "Summary interval")?;

        if timeout_ms >= RECOMMENDED_MAX_TIMEOUT_MS {
            warn!(
                "Timeout of {}ms is not below {}ms, slow attempts will spill into the next second",
                timeout_ms, RECOMMENDED_MAX_TIMEOUT_MS
            );
        }

        let local_ip = parse_local_ip(self.local_ip.as_deref())?;

        let target = match (self.remote_addr, self.url) {
            (Some(remote), None) => Target::Tcp(resolve_remote(&remote, local_ip).await?),
            (None, Some(url)) => {
                let url = Url::parse(&url).with_context(|| format!("invalid URL: {:?}", url))?;
                if url.scheme() != "http" {
                    anyhow::bail!("Unsupported URL scheme {:?}, only http is probed", url.scheme());
                }
                Target::Http(url)
            }
            _ => anyhow::bail!("Exactly one of --remote-addr and --url is required"),
        };

        let format = ExporterType::parse(&self.format)?;
        if format == ExporterType::Prometheus && self.output.is_none() {
            anyhow::bail!("The prometheus format needs an --output file");
        }

        Ok(ClientConfig {
            workers: self.workers,
            worker: WorkerConfig {
                dial_interval: Duration::from_micros(dial_interval_us),
                timeout: Duration::from_millis(timeout_ms),
                target,
                local_ip,
            },
            summary_interval: Duration::from_secs(summary_interval_sec),
            format,
            output: self.output,
            flush_on_shutdown: self.flush_on_shutdown,
        })
    }
}

impl ServerArgs {
    /// Validate the arguments
    pub async fn into_config(self) -> Result<ServerConfig> {
        if self.workers == 0 {
            anyhow::bail!("Worker count must be >= 1");
        }

        let listen_addr = tokio::net::lookup_host(&self.local_addr)
            .await
            .with_context(|| format!("unable to resolve listen address: {:?}", self.local_addr))?
            .next()
            .with_context(|| format!("no address found for {:?}", self.local_addr))?;

        Ok(ServerConfig {
            listen_addr,
            workers: self.workers,
            http: self.http,
        })
    }
}
