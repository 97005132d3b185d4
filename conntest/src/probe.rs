//! Network probes
//!
//! A probe performs the single network operation a worker runs on every
//! tick. Any resource it opens is released before the attempt returns.

use anyhow::{Context, Result};
use log::debug;
use reqwest::Url;
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
};
use tokio::net::TcpSocket;

/// One network operation, repeated by every worker of a pool
///
/// The worker bounds each attempt with its timeout; dropping the returned
/// future must release every socket it opened.
pub trait Probe: Send + Sync + 'static {
    /// Perform one attempt
    ///
    /// Returns the request id when the probe tags its requests, so slow
    /// attempts can be matched against the target's logs.
    fn attempt(&self) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Target description for log lines
    fn describe(&self) -> String;
}

/// Raw TCP connect followed by an immediate close
#[derive(Debug, Clone)]
pub struct TcpProbe {
    remote: SocketAddr,
    local_ip: Option<IpAddr>,
}

impl TcpProbe {
    /// Create a new TCP probe
    ///
    /// # Arguments
    ///
    /// * `remote` - Address to connect to
    /// * `local_ip` - Optional source IP; the port is always picked by the kernel
    pub fn new(remote: SocketAddr, local_ip: Option<IpAddr>) -> Self {
        Self { remote, local_ip }
    }
}

impl Probe for TcpProbe {
    async fn attempt(&self) -> Result<Option<u64>> {
        let socket = if self.remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create socket")?;

        if let Some(ip) = self.local_ip {
            socket
                .bind(SocketAddr::new(ip, 0))
                .with_context(|| format!("Failed to bind to {}", ip))?;
        }

        let stream = socket.connect(self.remote).await?;
        drop(stream);

        Ok(None)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.remote)
    }
}

/// HTTP GET with a random query parameter defeating caches
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    /// Create a new HTTP probe
    ///
    /// Idle connections are never kept and proxies are ignored, so every
    /// attempt opens a fresh connection straight to the target.
    ///
    /// # Arguments
    ///
    /// * `url` - URL to fetch
    /// * `local_ip` - Optional source IP
    pub fn new(url: Url, local_ip: Option<IpAddr>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .no_proxy()
            .local_address(local_ip)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, url })
    }
}

impl Probe for HttpProbe {
    async fn attempt(&self) -> Result<Option<u64>> {
        let request_id: u64 = rand::random();
        let url = cache_busting_url(&self.url, request_id);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await.context("Failed to read response body")?;

        debug!(
            "request {} answered {} with {} bytes",
            request_id,
            status,
            body.len()
        );

        Ok(Some(request_id))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Append a request id to the query string of `base`
pub fn cache_busting_url(base: &Url, request_id: u64) -> Url {
    let mut url = base.clone();
    let query = match base.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, request_id),
        _ => request_id.to_string(),
    };
    url.set_query(Some(&query));
    url
}
