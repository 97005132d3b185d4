//! SNAT race connection tester
//!
//! Opens many short-lived connections at a controlled rate and
//! periodically prints latency and error statistics, to reproduce
//! source-NAT port reuse races.
//!
//! ## Usage
//!
//! ```bash
//! # Target server accepting and closing connections
//! ./snat-race-conn-test server --local-addr 0.0.0.0:8080
//!
//! # 16 workers, one connection every 50ms each, summary every 5 seconds
//! ./snat-race-conn-test client --remote-addr 10.0.0.12:8080 -c 16 -d 50000
//!
//! # HTTP GET instead of raw TCP, JSON summaries on stdout
//! ./snat-race-conn-test client --url http://10.0.0.12:8080/ --format json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use snat_conntest::{
    client::run_client,
    config::{ClientArgs, ServerArgs, Target},
    server::TargetServer,
};
use tokio_util::sync::CancellationToken;

/// Load generator reproducing SNAT port exhaustion races
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start workers that continuously connect to an endpoint and periodically print statistics
    #[clap(alias = "c")]
    Client(ClientArgs),

    /// Simple TCP server to connect to
    #[clap(alias = "s")]
    Server(ServerArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Command::Client(args) => {
            let config = args.into_config().await?;

            info!("Starting client...");
            match &config.worker.target {
                Target::Tcp(addr) => info!("   Target: tcp://{}", addr),
                Target::Http(url) => info!("   Target: {}", url),
            }
            if let Some(ip) = config.worker.local_ip {
                info!("   Local IP: {}", ip);
            }
            info!("   Workers: {}", config.workers);
            info!(
                "   Dial interval: {}us",
                config.worker.dial_interval.as_micros()
            );
            info!("   Timeout: {}ms", config.worker.timeout.as_millis());
            info!(
                "   Summary interval: {}s",
                config.summary_interval.as_secs()
            );
            info!("   Format: {:?}", config.format);

            let summary = run_client(config, cancel).await?;

            info!("");
            info!("============================================");
            info!("  Attempts:  {:>10}", summary.workers.attempts);
            info!("  Errors:    {:>10}", summary.totals.total_errors);
            info!("  Recorded:  {:>10}", summary.totals.total_attempts);
            info!("============================================");
        }
        Command::Server(args) => {
            let config = args.into_config().await?;
            let server = TargetServer::bind(&config).await?;
            server.serve(cancel).await?;
        }
    }

    Ok(())
}

/// Cancel on SIGINT, and on SIGTERM where available
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Unable to listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Interrupted, shutting down...");
        cancel.cancel();
    });
}

/// Banner on stderr, stdout may carry JSON summaries
fn print_banner() {
    eprintln!(
        r#"
╔═══════════════════════════════════════════════════╗
║          SNAT Race Connection Tester              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}
