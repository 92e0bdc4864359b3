//! The cluster-wide refresh loop.
//!
//! Refresh events are produced by watches over the desired state of every service and over the
//! inventory, by node health changes, and by operators through the admin API. The orchestrator
//! folds them together and, while this node holds the lease, runs every service leader in order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::bus::{RefreshEvent, RefreshReason};
use crate::context::{Context, Services};
use crate::election::LeaderState;
use crate::service::DynLeader;
use castle_core::inventory::Inventory;
use castle_core::keys;
use castle_core::kvs::WatchEvent;

const METRIC_LEADER_PASSES: &str = "castle_leader_passes";
const METRIC_LEADER_FAILURES: &str = "castle_leader_pass_failures";

const MIN_HEALTH_CHECK: Duration = Duration::from_millis(100);

/// The capacity of the refresh event channel.
pub const REFRESH_CHANNEL_CAPACITY: usize = 100;

/// Run every leader once, in order. A failing leader does not stop the ones after it; the
/// failures are returned once all of them had their turn.
#[tracing::instrument(level = "debug", skip(services, leaders))]
pub async fn refresh(services: &Arc<Services>, leaders: &[DynLeader], event: &RefreshEvent) -> Result<Vec<(&'static str, anyhow::Error)>> {
    let mut failures = vec![];
    for leader in leaders {
        let name = leader.name();
        // Each leader sees the inventory as of its own start.
        let ctx = Context::load(services).await.context("error loading context for leader pass")?;
        metrics::increment_counter!(METRIC_LEADER_PASSES, "service" => name);
        if let Err(err) = leader.configure(&ctx, event).await {
            metrics::increment_counter!(METRIC_LEADER_FAILURES, "service" => name);
            tracing::error!(error = ?err, service = name, "leader pass failed");
            failures.push((name, err));
        }
    }
    tracing::info!(reason = ?event.reason, failures = failures.len(), "refresh complete");
    Ok(failures)
}

/// The task running leader passes while this node leads.
pub struct Orchestrator {
    services: Arc<Services>,
    leaders: Vec<DynLeader>,
    events: ReceiverStream<RefreshEvent>,
    leader_state: watch::Receiver<LeaderState>,
    shutdown: BroadcastStream<()>,
}

impl Orchestrator {
    pub fn new(
        services: Arc<Services>, leaders: Vec<DynLeader>, events: mpsc::Receiver<RefreshEvent>, leader_state: watch::Receiver<LeaderState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            services,
            leaders,
            events: ReceiverStream::new(events),
            leader_state,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("orchestrator started");
        let mut leading = matches!(*self.leader_state.borrow(), LeaderState::Leading);
        if leading {
            self.run_pass(RefreshEvent::new(RefreshReason::Startup)).await;
        }
        loop {
            tokio::select! {
                Some(mut event) = self.events.next() => {
                    while let Some(Some(next)) = self.events.next().now_or_never() {
                        event.merge(next);
                    }
                    if leading {
                        self.run_pass(event).await;
                    } else {
                        tracing::debug!(reason = ?event.reason, "not leading, dropping refresh event");
                    }
                }
                Ok(_) = self.leader_state.changed() => {
                    let now_leading = matches!(*self.leader_state.borrow(), LeaderState::Leading);
                    if now_leading && !leading {
                        tracing::info!("took office, running startup refresh");
                        leading = true;
                        self.run_pass(RefreshEvent::new(RefreshReason::Startup)).await;
                    } else if !now_leading && leading {
                        tracing::info!("lost leadership");
                        leading = false;
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("orchestrator shutdown");
        Ok(())
    }

    async fn run_pass(&self, event: RefreshEvent) {
        if let Err(err) = refresh(&self.services, &self.leaders, &event).await {
            tracing::error!(error = ?err, "error running refresh");
        }
    }
}

/// The task turning watched changes into refresh events.
pub struct RefreshProducer {
    services: Arc<Services>,
    /// Keys beneath which a change calls for a refresh.
    watch_keys: Vec<String>,
    events_tx: mpsc::Sender<RefreshEvent>,
    shutdown: BroadcastStream<()>,
}

impl RefreshProducer {
    pub fn new(services: Arc<Services>, leaders: &[DynLeader], events_tx: mpsc::Sender<RefreshEvent>, shutdown: broadcast::Receiver<()>) -> Self {
        let cluster = &services.config.cluster_name;
        let watch_keys = leaders.iter().flat_map(|leader| leader.refresh_keys(cluster)).collect();
        Self {
            services,
            watch_keys,
            events_tx,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let kvs = self.services.kvs.clone();
        let mut desired = stream::select_all(self.watch_keys.iter().map(|key| kvs.watch(key)));
        let mut inventory = kvs.watch(keys::INVENTORY_NODES);
        let mut health_check = tokio::time::interval((self.services.config.unhealthy_threshold() / 2).max(MIN_HEALTH_CHECK));
        let mut snapshot = self.snapshot().await.unwrap_or_default();
        tracing::debug!(watch_keys = ?self.watch_keys, "refresh producer started");

        loop {
            let event = tokio::select! {
                Some(change) = desired.next() => Some(RefreshEvent::new(RefreshReason::DesiredChanged(change.key))),
                Some(change) = inventory.next() => match self.inventory_changed(&change, &mut snapshot).await {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = ?err, "error handling inventory change");
                        None
                    }
                },
                _ = health_check.tick() => match self.health_changed(&mut snapshot).await {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = ?err, "error checking node health");
                        None
                    }
                },
                _ = self.shutdown.next() => break,
            };
            if let Some(event) = event {
                tracing::debug!(reason = ?event.reason, "requesting refresh");
                if self.events_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        tracing::debug!("refresh producer shutdown");
        Ok(())
    }

    async fn snapshot(&self) -> Result<NodeSnapshot> {
        let inventory = Inventory::load(self.services.kvs.as_ref()).await?;
        Ok(NodeSnapshot::from_inventory(&inventory, self.services.config.unhealthy_threshold()))
    }

    /// Membership and disk changes call for a refresh, heartbeats alone do not.
    async fn inventory_changed(&self, change: &WatchEvent, snapshot: &mut NodeSnapshot) -> Result<Option<RefreshEvent>> {
        let node = match node_of(&change.key) {
            Some(node) => node,
            None => return Ok(None),
        };
        if change.key.ends_with("/heartbeat") && snapshot.nodes.contains(node) {
            return Ok(None);
        }
        let next = self.snapshot().await?;
        let mut event = snapshot.diff(&next, RefreshReason::Inventory);
        if event.nodes_added.is_empty() && event.nodes_removed.is_empty() {
            event.nodes_changed.insert(node.to_string());
        }
        *snapshot = next;
        Ok(Some(event))
    }

    /// Nodes crossing the health threshold in either direction call for a refresh.
    async fn health_changed(&self, snapshot: &mut NodeSnapshot) -> Result<Option<RefreshEvent>> {
        let next = self.snapshot().await?;
        let event = snapshot.diff(&next, RefreshReason::Inventory);
        *snapshot = next;
        if event.nodes_added.is_empty() && event.nodes_removed.is_empty() && event.nodes_changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(event))
    }
}

/// The node id a key beneath the inventory belongs to.
pub fn node_of(key: &str) -> Option<&str> {
    key.strip_prefix(keys::INVENTORY_NODES)?
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|node| !node.is_empty())
}

/// The known nodes and which of them are healthy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub nodes: BTreeSet<String>,
    pub healthy: BTreeSet<String>,
}

impl NodeSnapshot {
    pub fn from_inventory(inventory: &Inventory, threshold: Duration) -> Self {
        Self {
            nodes: inventory.nodes.keys().cloned().collect(),
            healthy: inventory.healthy_nodes(chrono::Utc::now(), threshold).into_iter().collect(),
        }
    }

    /// The event describing the move from this snapshot to `next`. Health flips count as changes.
    pub fn diff(&self, next: &NodeSnapshot, reason: RefreshReason) -> RefreshEvent {
        let mut event = RefreshEvent::new(reason);
        event.nodes_added = next.nodes.difference(&self.nodes).cloned().collect();
        event.nodes_removed = self.nodes.difference(&next.nodes).cloned().collect();
        event.nodes_changed = self
            .healthy
            .symmetric_difference(&next.healthy)
            .filter(|node| self.nodes.contains(*node) && next.nodes.contains(*node))
            .cloned()
            .collect();
        event
    }
}

pub fn register_metrics() {
    metrics::register_counter!(METRIC_LEADER_PASSES, metrics::Unit::Count, "leader passes run");
    metrics::register_counter!(METRIC_LEADER_FAILURES, metrics::Unit::Count, "leader passes which failed");
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
