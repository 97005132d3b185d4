//! Probe target server
//!
//! Accepts connections and closes them right away. With HTTP responses
//! enabled, every request is answered with a plain `200 OK` instead.

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use axum::Router;
use log::{debug, info, warn};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Accept-and-close TCP server
pub struct TargetServer {
    listener: TcpListener,
    workers: usize,
    http: bool,
}

impl TargetServer {
    /// Bind the listening socket
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("error while listening on '{}'", config.listen_addr))?;

        Ok(Self {
            listener,
            workers: config.workers,
            http: config.http,
        })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serve until cancelled
    ///
    /// Plain mode runs one accept loop per configured worker and returns
    /// once all of them have stopped. HTTP mode returns once in-flight
    /// requests have been answered.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;

        if self.http {
            info!("Ready to answer HTTP requests on {}", addr);
            serve_http(self.listener, cancel).await?;
        } else {
            info!(
                "Ready to accept connections on {} ({} accept loops)",
                addr, self.workers
            );
            serve_plain(Arc::new(self.listener), self.workers, cancel).await?;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn ok() -> &'static str {
    "ok"
}

async fn serve_http(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let app = Router::new().fallback(ok);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn serve_plain(listener: Arc<TcpListener>, workers: usize, cancel: CancellationToken) -> Result<()> {
    let mut loops = JoinSet::new();
    for id in 0..workers {
        loops.spawn(accept_loop(id, Arc::clone(&listener), cancel.clone()));
    }

    while let Some(joined) = loops.join_next().await {
        joined.context("Accept loop failed")?;
    }
    Ok(())
}

async fn accept_loop(id: usize, listener: Arc<TcpListener>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => drop(stream),
                Err(e) => {
                    warn!("accept loop {}: error while accepting new connection: {}", id, e);
                    // Usually fd exhaustion, give the kernel a moment
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }

    debug!("accept loop {} stopped", id);
}
