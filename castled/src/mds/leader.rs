use std::collections::BTreeMap;

use anyhow::{bail, Context as _, Result};

use super::{MdsRecord, FS_SERVICE, MDS_SERVICE};
use crate::bus::{self, RefreshEvent, RefreshReason};
use crate::ceph::cluster::ClusterInfo;
use crate::ceph::config as ceph_config;
use crate::context::Context;
use crate::service::ServiceLeader;
use castle_core::keys;

/// The MDS instances each file system runs.
const MDS_PER_FILESYSTEM: usize = 1;

/// The leader of file services.
#[derive(Default)]
pub struct MdsLeader;

#[async_trait::async_trait]
impl ServiceLeader for MdsLeader {
    fn name(&self) -> &'static str {
        MDS_SERVICE
    }

    fn refresh_keys(&self, cluster: &str) -> Vec<String> {
        vec![keys::desired_key(cluster, FS_SERVICE)]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, event))]
    async fn configure(&self, ctx: &Context, event: &RefreshEvent) -> Result<()> {
        let desired = super::load_filesystems(ctx.kvs(), ctx.cluster(), false).await?;
        let applied = super::load_filesystems(ctx.kvs(), ctx.cluster(), true).await?;
        let force = matches!(event.reason, RefreshReason::Manual | RefreshReason::Startup);
        let to_enable: BTreeMap<&String, &String> = desired
            .iter()
            .filter(|(name, pool)| force || applied.get(*name) != Some(*pool))
            .collect();
        let to_disable: Vec<&String> = applied.keys().filter(|name| !desired.contains_key(*name)).collect();
        if to_enable.is_empty() && to_disable.is_empty() {
            tracing::debug!("file services are up to date");
            return Ok(());
        }

        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;

        let mut failures = vec![];
        for (name, pool) in to_enable {
            if let Err(err) = enable(ctx, name, pool).await {
                tracing::error!(error = ?err, filesystem = %name, "error enabling file system");
                failures.push(format!("{}: {:#}", name, err));
            }
        }
        for name in to_disable {
            if let Err(err) = disable(ctx, name).await {
                tracing::error!(error = ?err, filesystem = %name, "error removing file system");
                failures.push(format!("{}: {:#}", name, err));
            }
        }
        if !failures.is_empty() {
            bail!("file services failed: {}", failures.join("; "));
        }
        Ok(())
    }
}

async fn enable(ctx: &Context, name: &str, pool: &str) -> Result<()> {
    create_filesystem(ctx, name).await?;

    let placed = place_mds(ctx, name).await?;
    let nodes: Vec<String> = placed.iter().map(|rec| rec.node_id.clone()).collect();
    tracing::info!(filesystem = name, nodes = ?nodes, "starting mds");
    bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, MDS_SERVICE, nodes.len(), ctx.config().trigger_timeout(nodes.len()))
        .await?
        .ensure(MDS_SERVICE)?;

    for rec in placed.iter() {
        super::store_mds(ctx.kvs(), ctx.cluster(), rec, true).await?;
    }
    super::mark_filesystem_applied(ctx.kvs(), ctx.cluster(), name, pool).await?;
    tracing::info!(filesystem = name, "file system applied");
    Ok(())
}

/// Create the pools and the file system itself unless the cluster already has it.
async fn create_filesystem(ctx: &Context, name: &str) -> Result<()> {
    let client = ctx.ceph();
    if client.fs_list().await?.iter().any(|fs| fs == name) {
        tracing::debug!(filesystem = name, "file system already exists");
        return Ok(());
    }
    let (data, metadata) = (super::data_pool(name), super::metadata_pool(name));
    for pool in [&data, &metadata] {
        client.pool_create(pool).await.with_context(|| format!("error creating pool {}", pool))?;
    }
    client
        .fs_new(name, &metadata, &data)
        .await
        .with_context(|| format!("error creating file system {}", name))?;
    tracing::info!(filesystem = name, data_pool = %data, metadata_pool = %metadata, "created file system");
    Ok(())
}

/// The MDS placements serving the given file system, placing new ones on healthy nodes which
/// host no MDS yet. Ids count up from 1 across the cluster.
async fn place_mds(ctx: &Context, name: &str) -> Result<Vec<MdsRecord>> {
    let all = super::load_mds(ctx.kvs(), ctx.cluster(), false).await?;
    let mut placed: Vec<MdsRecord> = all.iter().filter(|rec| rec.filesystem == name).cloned().collect();
    let mut next_id = all.iter().map(|rec| rec.id + 1).max().unwrap_or(1);

    for node_id in ctx.inventory.nodes.keys() {
        if placed.len() >= MDS_PER_FILESYSTEM {
            break;
        }
        if !ctx.is_healthy(node_id) || all.iter().any(|rec| &rec.node_id == node_id) {
            continue;
        }
        let rec = MdsRecord {
            node_id: node_id.clone(),
            id: next_id,
            filesystem: name.to_string(),
        };
        next_id += 1;
        super::store_mds(ctx.kvs(), ctx.cluster(), &rec, false).await?;
        tracing::info!(filesystem = name, node = %rec.node_id, mds = rec.id, "placed mds");
        placed.push(rec);
    }

    if placed.len() < MDS_PER_FILESYSTEM {
        bail!("not enough nodes for mds of file system {}, required {}, found {}", name, MDS_PER_FILESYSTEM, placed.len());
    }
    Ok(placed)
}

/// Take the file system down, stop its MDS and remove it from the cluster.
async fn disable(ctx: &Context, name: &str) -> Result<()> {
    tracing::info!(filesystem = name, "removing file system");
    let client = ctx.ceph();
    client
        .fs_set_cluster_down(name)
        .await
        .with_context(|| format!("error marking file system {} down", name))?;
    let details = client.fs_get(name).await?;
    for mds in details.mdsmap.info.values() {
        client
            .mds_fail(mds.gid)
            .await
            .with_context(|| format!("error failing mds {} ({})", mds.name, mds.gid))?;
    }

    for rec in super::load_mds(ctx.kvs(), ctx.cluster(), false).await?.iter().filter(|rec| rec.filesystem == name) {
        super::remove_mds(ctx.kvs(), ctx.cluster(), &rec.node_id, false).await?;
    }
    let applied: Vec<MdsRecord> = super::load_mds(ctx.kvs(), ctx.cluster(), true)
        .await?
        .into_iter()
        .filter(|rec| rec.filesystem == name)
        .collect();
    let nodes: Vec<String> = applied.iter().map(|rec| rec.node_id.clone()).collect();
    // Nodes hosting the MDS may be gone.
    let outcome = bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, MDS_SERVICE, 0, ctx.config().removal_timeout()).await?;
    if !outcome.timed_out.is_empty() || !outcome.failed.is_empty() {
        tracing::warn!(filesystem = name, timed_out = ?outcome.timed_out, failed = ?outcome.failed, "not every mds confirmed it stopped");
    }
    for rec in applied.iter() {
        super::remove_mds(ctx.kvs(), ctx.cluster(), &rec.node_id, true).await?;
    }

    client
        .fs_rm(name)
        .await
        .with_context(|| format!("error removing file system {}", name))?;
    super::mark_filesystem_unapplied(ctx.kvs(), ctx.cluster(), name).await?;
    tracing::info!(filesystem = name, "removed file system");
    Ok(())
}
