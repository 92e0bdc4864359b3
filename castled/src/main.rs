//! The castle node daemon.

mod agent;
mod app;
mod bus;
mod ceph;
mod config;
mod context;
mod database;
mod election;
mod error;
mod exec;
#[cfg(test)]
mod fixtures;
mod heartbeat;
mod mds;
mod mon;
mod orchestrator;
mod osd;
mod proc;
mod prom;
mod rgw;
mod server;
mod service;
mod sys;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system. `RUST_LOG` wins over the configured default.
    let filter = if cfg.rust_log.is_empty() {
        tracing_subscriber::EnvFilter::new(format!("castled={}", cfg.log_level))
    } else {
        tracing_subscriber::EnvFilter::new(&cfg.rust_log)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        .try_init()
        .context("error initializing logging/tracing system")?;

    prom::install(&cfg)?;
    tracing::info!(
        node = %cfg.node_id,
        cluster = %cfg.cluster_name,
        public_ip = %cfg.public_ip,
        admin_port = %cfg.admin_port,
        metrics_port = %cfg.metrics_port,
        "starting castle node daemon",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
