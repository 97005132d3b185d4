//! SNAT race connection tester library
//!
//! Provides the probe workers, the windowed statistics aggregator and the
//! target server behind the `snat-race-conn-test` binary.

pub mod aggregator;
pub mod client;
pub mod collector;
pub mod config;
pub mod exporter;
pub mod probe;
pub mod server;
pub mod types;
pub mod worker;

pub use aggregator::Aggregator;
pub use client::{run_client, run_client_with_reporter, RunSummary};
pub use collector::{RunCounters, Window, WindowCollector};
pub use config::{ClientArgs, ClientConfig, ServerArgs, ServerConfig, Target, WorkerConfig};
pub use exporter::{ExporterType, JsonReporter, PrometheusReporter, TextReporter, WindowReporter};
pub use probe::{HttpProbe, Probe, TcpProbe};
pub use server::TargetServer;
pub use types::*;
pub use worker::{ProbeWorker, WorkerPool, WorkerReport};
