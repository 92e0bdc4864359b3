use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::agent::AgentCtl;
use crate::config::{Config, KvsBackend};
use crate::context::Services;
use crate::database::Database;
use crate::election::{Elector, LeaseConfig};
use crate::exec::HostExecutor;
use crate::heartbeat::Heartbeat;
use crate::orchestrator::{Orchestrator, RefreshProducer, REFRESH_CHANNEL_CAPACITY};
use crate::proc::ProcManager;
use crate::prom::{spawn_prom_server, spawn_proc_metrics_sampler};
use crate::server::AdminServer;
use crate::service;
use castle_core::kvs::{DynKvs, EtcdKvs, SledKvs};

/// The application object for when castled is running as a node daemon.
pub struct App {
    services: Arc<Services>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of the service agents of this node.
    agent_handles: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the inventory publisher.
    heartbeat_handle: JoinHandle<Result<()>>,
    /// The join handle of the leader elector.
    elector_handle: JoinHandle<()>,
    /// The join handle of the orchestrator.
    orchestrator_handle: JoinHandle<Result<()>>,
    /// The join handle of the refresh producer.
    producer_handle: JoinHandle<Result<()>>,
    /// The join handle of the admin server.
    admin_server: JoinHandle<()>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
    /// The join handle of the process metrics sampler.
    sampler: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let kvs: DynKvs = match config.kvs_backend() {
            KvsBackend::Etcd(endpoints) => Arc::new(EtcdKvs::connect(&endpoints).await.context("error connecting to control-plane store")?),
            KvsBackend::NodeLocal => {
                tracing::warn!("no KVS_ENDPOINTS configured, keeping control-plane state in the node-local database");
                Arc::new(SledKvs::from_db(db.db()).await.context("error opening control-plane store")?)
            }
        };
        let services = Arc::new(Services {
            config: config.clone(),
            kvs: kvs.clone(),
            executor: Arc::new(HostExecutor),
            supervisor: Arc::new(ProcManager::new(config.clone())),
            db,
            shutdown_tx: shutdown_tx.clone(),
        });

        let heartbeat_handle = Heartbeat::new(services.clone(), shutdown_tx.subscribe()).spawn();
        let agent_handles = service::agents()
            .into_iter()
            .map(|agent| AgentCtl::new(services.clone(), agent, shutdown_tx.subscribe()).spawn())
            .collect();

        let lease = LeaseConfig::new(
            Duration::from_secs(config.lease_duration_secs),
            Duration::from_secs(config.renew_deadline_secs),
            Duration::from_secs(config.retry_period_secs),
        )?;
        let (elector, leader_state) = Elector::new(kvs, &config.cluster_name, config.node_id.clone(), lease, shutdown_tx.subscribe());
        let elector_handle = elector.spawn();

        let leaders = service::leaders();
        let (events_tx, events_rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        let producer_handle = RefreshProducer::new(services.clone(), &leaders, events_tx.clone(), shutdown_tx.subscribe()).spawn();
        let orchestrator_handle = Orchestrator::new(services.clone(), leaders, events_rx, leader_state.clone(), shutdown_tx.subscribe()).spawn();

        let admin_server = AdminServer::new(services.clone(), events_tx, leader_state).spawn();
        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());
        let sampler = spawn_proc_metrics_sampler(shutdown_tx.subscribe());

        Ok(Self {
            services,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            agent_handles,
            heartbeat_handle,
            elector_handle,
            orchestrator_handle,
            producer_handle,
            admin_server,
            metrics_server,
            sampler,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("castled is shutting down");
        if let Err(err) = self.orchestrator_handle.await.context("error joining orchestrator handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down orchestrator");
        }
        if let Err(err) = self.producer_handle.await.context("error joining refresh producer handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down refresh producer");
        }
        if let Err(err) = self.elector_handle.await {
            tracing::error!(error = ?err, "error joining leader elector task");
        }
        for handle in self.agent_handles {
            if let Err(err) = handle.await.context("error joining agent handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down agent");
            }
        }
        if let Err(err) = self.heartbeat_handle.await.context("error joining heartbeat handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down heartbeat");
        }
        self.services.supervisor.stop_all().await;
        if let Err(err) = self.admin_server.await {
            tracing::error!(error = ?err, "error joining admin server task");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        if let Err(err) = self.sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }

        tracing::debug!("castled shutdown complete");
        Ok(())
    }
}
