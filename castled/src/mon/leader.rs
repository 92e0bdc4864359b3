//! Monitor placement.
//!
//! The leader sizes the monitor set from the node count, replaces monitors on unhealthy nodes
//! with monitors on healthy ones, rolls the set out and waits for quorum before the retired
//! monitors are removed from it.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

use crate::bus::{self, RefreshEvent, RefreshReason};
use crate::ceph::cluster::{self, ClusterInfo, MonitorRecord, MONITOR_SERVICE, MON_PORT};
use crate::ceph::{config as ceph_config, CephClient};
use crate::context::Context;
use crate::service::ServiceLeader;
use castle_core::{keys, AppError};

/// The sentinel recording that the initial CRUSH map was created.
const KEY_CRUSH_INITIALIZED: &str = "crushMapInitialized";

/// The number of monitors a cluster of the given size runs.
pub fn monitor_count(nodes: usize) -> usize {
    match nodes {
        0 => 0,
        1..=2 => 1,
        3..=20 => 3,
        21..=100 => 5,
        _ => 7,
    }
}

/// The leader of the monitor service.
#[derive(Default)]
pub struct MonLeader;

/// The monitor set chosen by a leader pass.
#[derive(Debug, Default)]
struct Placement {
    /// The desired monitors by node, including the ones just added.
    monitors: BTreeMap<String, MonitorRecord>,
    /// Nodes which were just given a monitor.
    added: Vec<String>,
    /// Monitors on unhealthy nodes, already dropped from the desired state.
    retired: BTreeMap<String, MonitorRecord>,
}

#[async_trait::async_trait]
impl ServiceLeader for MonLeader {
    fn name(&self) -> &'static str {
        MONITOR_SERVICE
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, event))]
    async fn configure(&self, ctx: &Context, event: &RefreshEvent) -> Result<()> {
        ClusterInfo::create_or_load(ctx.kvs(), ctx.cluster(), &ctx.config().admin_secret)
            .await
            .context("error loading cluster identity")?;

        let placement = choose_monitors(ctx).await?;
        if placement.monitors.is_empty() {
            return Ok(());
        }
        let applied: BTreeMap<String, MonitorRecord> = cluster::load_monitors(ctx.kvs(), ctx.cluster(), true)
            .await?
            .into_iter()
            .map(|rec| (rec.node_id.clone(), rec))
            .collect();
        let changed = !placement.added.is_empty() || !placement.retired.is_empty() || applied != placement.monitors;
        if !changed && !matches!(event.reason, RefreshReason::Manual | RefreshReason::Startup) {
            tracing::debug!("monitors are up to date");
            return Ok(());
        }

        let nodes: Vec<String> = placement.monitors.keys().cloned().collect();
        bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, MONITOR_SERVICE, nodes.len(), ctx.config().trigger_timeout(nodes.len()))
            .await?
            .ensure(MONITOR_SERVICE)?;

        // Reload so that the admin config names the monitors just placed.
        let info = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &info).await?;

        let names: Vec<String> = placement.monitors.values().map(|rec| rec.name.clone()).collect();
        wait_for_quorum(&ctx.ceph(), &names, ctx.config().quorum_retries, ctx.config().quorum_interval()).await?;
        create_initial_crush_map(ctx).await?;

        if !placement.retired.is_empty() {
            if let Err(err) = remove_monitors(ctx, &placement.retired).await {
                tracing::warn!(error = ?err, "failed to remove monitors from quorum");
            }
        }
        mark_applied(ctx, &placement.monitors).await
    }
}

/// Compute the desired monitor set and record it.
async fn choose_monitors(ctx: &Context) -> Result<Placement> {
    let target = monitor_count(ctx.inventory.nodes.len());
    let mut monitors: BTreeMap<String, MonitorRecord> = cluster::load_monitors(ctx.kvs(), ctx.cluster(), false)
        .await?
        .into_iter()
        .map(|rec| (rec.node_id.clone(), rec))
        .collect();
    let retired: BTreeMap<String, MonitorRecord> = monitors
        .iter()
        .filter(|(node_id, _)| !ctx.is_healthy(node_id))
        .map(|(node_id, rec)| (node_id.clone(), rec.clone()))
        .collect();

    let to_add = (target + retired.len()).saturating_sub(monitors.len());
    tracing::info!(current = monitors.len(), target, unhealthy = retired.len(), to_add, "monitor state");

    let mut added = vec![];
    if to_add > 0 {
        let mut next = next_monitor_index(&monitors)?;
        for node in ctx.inventory.nodes.values() {
            if added.len() == to_add {
                break;
            }
            if monitors.contains_key(&node.node_id) {
                continue;
            }
            if !ctx.is_healthy(&node.node_id) {
                tracing::info!(node = %node.node_id, "skipping unhealthy node as a monitor");
                continue;
            }
            if node.public_ip.is_empty() {
                tracing::warn!(node = %node.node_id, "skipping node without a public ip as a monitor");
                continue;
            }
            let rec = MonitorRecord {
                node_id: node.node_id.clone(),
                name: format!("mon{}", next),
                ip: node.public_ip.clone(),
                port: MON_PORT,
            };
            next += 1;
            added.push(node.node_id.clone());
            monitors.insert(node.node_id.clone(), rec);
        }
        if added.len() < to_add {
            bail!("only found {} of the {} nodes needed for new monitors", added.len(), to_add);
        }
    }

    for node_id in added.iter() {
        if let Some(rec) = monitors.get(node_id) {
            tracing::info!(node = %node_id, monitor = %rec.name, "adding monitor");
            cluster::store_monitor(ctx.kvs(), ctx.cluster(), rec, false).await?;
        }
    }
    for (node_id, rec) in retired.iter() {
        tracing::info!(node = %node_id, monitor = %rec.name, "removing monitor from desired state");
        ctx.kvs()
            .delete(&keys::desired_node_key(ctx.cluster(), MONITOR_SERVICE, node_id), true)
            .await?;
        monitors.remove(node_id);
    }
    Ok(Placement { monitors, added, retired })
}

/// The index following the highest monitor index in use.
fn next_monitor_index(monitors: &BTreeMap<String, MonitorRecord>) -> Result<u32> {
    let mut next = 0;
    for rec in monitors.values() {
        match rec.index() {
            Some(idx) => next = next.max(idx + 1),
            None => bail!("invalid monitor id {}", rec.name),
        }
    }
    Ok(next)
}

/// Poll the monitor status until every named monitor is in the monitor map and in quorum.
pub async fn wait_for_quorum(client: &CephClient, names: &[String], retries: u32, interval: Duration) -> Result<()> {
    tracing::info!(monitors = ?names, "waiting for monitor quorum");
    for attempt in 0..retries {
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        let status = match client.mon_status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(error = ?err, "failed to get monitor status");
                continue;
            }
        };
        match names.iter().find(|name| !status.in_quorum(name)) {
            None => {
                tracing::info!("monitors formed quorum");
                return Ok(());
            }
            Some(name) => tracing::warn!(monitor = %name, "monitor is not in quorum yet"),
        }
    }
    Err(AppError::QuorumLoss(format!("monitors {:?} did not form a quorum after {} attempts", names, retries)).into())
}

async fn create_initial_crush_map(ctx: &Context) -> Result<()> {
    let key = keys::join([keys::cluster_root(ctx.cluster()).as_str(), KEY_CRUSH_INITIALIZED]);
    if ctx.kvs().get(&key).await?.as_deref() == Some(keys::MARKER_SET) {
        return Ok(());
    }
    tracing::info!("creating initial crush map");
    ctx.ceph().create_default_crush_map().await?;
    ctx.kvs().set(&key, keys::MARKER_SET).await
}

/// Stop the retired monitors and drop them from the quorum. Their nodes are likely gone, so
/// the agents only get a short time to answer.
async fn remove_monitors(ctx: &Context, retired: &BTreeMap<String, MonitorRecord>) -> Result<()> {
    let nodes: Vec<String> = retired.keys().cloned().collect();
    let outcome = bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, MONITOR_SERVICE, 0, ctx.config().removal_timeout()).await?;
    if !outcome.timed_out.is_empty() {
        tracing::debug!(nodes = ?outcome.timed_out, "retired monitors did not respond");
    }

    let client = ctx.ceph();
    for (node_id, rec) in retired.iter() {
        client
            .mon_remove(&rec.name)
            .await
            .with_context(|| format!("error removing monitor {} from quorum", rec.name))?;
        ctx.kvs()
            .delete(&keys::applied_node_key(ctx.cluster(), MONITOR_SERVICE, node_id), true)
            .await?;
        tracing::info!(node = %node_id, monitor = %rec.name, "removed monitor from quorum");
    }
    Ok(())
}

/// Make the applied monitors match the given desired set.
async fn mark_applied(ctx: &Context, monitors: &BTreeMap<String, MonitorRecord>) -> Result<()> {
    for rec in monitors.values() {
        cluster::store_monitor(ctx.kvs(), ctx.cluster(), rec, true).await?;
    }
    let applied = ctx.kvs().list_children(&keys::applied_key(ctx.cluster(), MONITOR_SERVICE)).await?;
    for node_id in applied.iter().filter(|node_id| !monitors.contains_key(*node_id)) {
        ctx.kvs()
            .delete(&keys::applied_node_key(ctx.cluster(), MONITOR_SERVICE, node_id), true)
            .await?;
    }
    Ok(())
}
