//! Prometheus metrics: the global recorder, process metrics and the scrape endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

const METRIC_OPEN_FDS: &str = "process_open_fds";
const METRIC_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
const METRIC_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
const METRIC_THREADS: &str = "process_threads";

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();

/// Get the metrics recorder, building it on first use with the node's labels.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("cluster", config.cluster_name.clone())
            .add_global_label("node", config.node_id.clone())
            .build()
    })
}

/// Install the recorder and describe every metric the daemon emits.
pub fn install(config: &Config) -> Result<()> {
    metrics::set_recorder(get_metrics_recorder(config)).context("error setting prometheus metrics recorder")?;
    metrics::register_gauge!(METRIC_OPEN_FDS, metrics::Unit::Count, "open file descriptors of the daemon");
    metrics::register_gauge!(METRIC_VIRTUAL_MEMORY_BYTES, metrics::Unit::Bytes, "virtual memory size of the daemon");
    metrics::register_gauge!(METRIC_RESIDENT_MEMORY_BYTES, metrics::Unit::Bytes, "resident memory size of the daemon");
    metrics::register_gauge!(METRIC_THREADS, metrics::Unit::Count, "OS threads of the daemon");
    crate::agent::register_metrics();
    crate::bus::register_metrics();
    crate::orchestrator::register_metrics();
    Ok(())
}

/// Take one sample of the daemon's process metrics.
#[cfg(target_os = "linux")]
fn sample_proc_metrics() -> Result<()> {
    let proc = procfs::process::Process::myself().context("error reading own process stats")?;
    match proc.fd_count() {
        Ok(fds) => metrics::gauge!(METRIC_OPEN_FDS, fds as f64),
        Err(err) => tracing::debug!(error = ?err, "error counting open file descriptors"),
    }
    metrics::gauge!(METRIC_VIRTUAL_MEMORY_BYTES, proc.stat.vsize as f64);
    if let Ok(rss) = proc.stat.rss_bytes() {
        metrics::gauge!(METRIC_RESIDENT_MEMORY_BYTES, rss as f64);
    }
    metrics::gauge!(METRIC_THREADS, proc.stat.num_threads as f64);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn sample_proc_metrics() -> Result<()> {
    Ok(())
}

/// Spawn the process metrics sampler.
pub fn spawn_proc_metrics_sampler(mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sample_proc_metrics() {
                        tracing::error!(error = ?err, "error collecting process metrics sample");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Spawn the scrape endpoint on the metrics port.
pub fn spawn_prom_server(config: &Config, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let handle = get_metrics_recorder(config).handle();
    let app = Router::new().route("/metrics", get(scrape)).layer(AddExtensionLayer::new(handle));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("metrics server is listening at 0.0.0.0:{}/metrics", config.metrics_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

async fn scrape(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
