//! The per-node agent runtime.
//!
//! One controller runs per service on every node. It watches the node's trigger marker and its
//! desired-state subtree, and runs a reconcile whenever either changes. Bursts of changes are
//! coalesced into a single reconcile.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::bus;
use crate::context::{Context, Services};
use crate::service::DynAgent;
use castle_core::keys;

const METRIC_AGENT_RECONCILES: &str = "castle_agent_reconciles";
const METRIC_AGENT_FAILURES: &str = "castle_agent_reconcile_failures";

/// A controller driving one service agent on this node.
pub struct AgentCtl {
    services: Arc<Services>,
    agent: DynAgent,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl AgentCtl {
    pub fn new(services: Arc<Services>, agent: DynAgent, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            services,
            agent,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let (cluster, node, service) = (&self.services.config.cluster_name, &self.services.config.node_id, self.agent.name());
        let kvs = self.services.kvs.clone();
        let mut changes = stream::select(
            kvs.watch(&keys::trigger_key(cluster, node, service)),
            kvs.watch(&keys::desired_node_key(cluster, service, node)),
        );

        match Context::load(&self.services).await {
            Ok(ctx) => {
                if let Err(err) = self.agent.initialize(&ctx).await {
                    tracing::error!(error = ?err, service, "error initializing agent");
                }
            }
            Err(err) => tracing::error!(error = ?err, service, "error loading context for agent initialization"),
        }

        tracing::info!(service, "agent initialized");
        let _ = self.reconcile().await;
        loop {
            tokio::select! {
                Some(_) = changes.next() => {
                    // Coalesce whatever else is already pending.
                    while let Some(Some(_)) = changes.next().now_or_never() {}
                    let _ = self.reconcile().await;
                }
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!(service, "agent shutdown");
        Ok(())
    }

    /// Run one reconcile of this node and publish its outcome.
    #[tracing::instrument(level = "debug", skip(self), fields(service = self.agent.name()))]
    pub async fn reconcile(&self) -> Result<()> {
        let res = self.reconcile_inner().await;
        let service = self.agent.name();
        metrics::increment_counter!(METRIC_AGENT_RECONCILES, "service" => service);
        if let Err(err) = &res {
            metrics::increment_counter!(METRIC_AGENT_FAILURES, "service" => service);
            tracing::error!(error = ?err, service, "agent reconcile failed");
        }
        if let Err(err) = bus::report_status(self.services.kvs.as_ref(), &self.services.config.node_id, service, &res).await {
            tracing::error!(error = ?err, service, "error publishing agent status");
        }
        res
    }

    async fn reconcile_inner(&self) -> Result<()> {
        let ctx = Context::load(&self.services).await?;
        let desired = ctx
            .kvs()
            .get_tree(&keys::desired_node_key(ctx.cluster(), self.agent.name(), ctx.node_id()))
            .await
            .context("error reading desired state of node")?;
        if desired.is_empty() {
            self.agent.destroy(&ctx).await
        } else {
            self.agent.configure(&ctx).await
        }
    }
}

pub fn register_metrics() {
    metrics::register_counter!(METRIC_AGENT_RECONCILES, metrics::Unit::Count, "agent reconcile passes");
    metrics::register_counter!(METRIC_AGENT_FAILURES, metrics::Unit::Count, "agent reconcile passes which failed");
}
