use anyhow::{Context as _, Result};

use super::{OBJECT_SERVICE, RGW_SERVICE};
use crate::bus::{self, RefreshEvent, RefreshReason};
use crate::ceph::cluster::ClusterInfo;
use crate::ceph::config as ceph_config;
use crate::ceph::keyring::{self, RGW_USERNAME};
use crate::context::Context;
use crate::service::ServiceLeader;
use castle_core::keys;

const RGW_CAPS: [&str; 4] = ["osd", "allow rwx", "mon", "allow rw"];

/// The leader of the object store.
#[derive(Default)]
pub struct RgwLeader;

#[async_trait::async_trait]
impl ServiceLeader for RgwLeader {
    fn name(&self) -> &'static str {
        RGW_SERVICE
    }

    fn refresh_keys(&self, cluster: &str) -> Vec<String> {
        vec![keys::desired_key(cluster, OBJECT_SERVICE)]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, event))]
    async fn configure(&self, ctx: &Context, event: &RefreshEvent) -> Result<()> {
        let desired = super::object_store_enabled(ctx.kvs(), ctx.cluster(), false).await?;
        let applied = super::object_store_enabled(ctx.kvs(), ctx.cluster(), true).await?;
        if desired {
            let force = matches!(event.reason, RefreshReason::Manual | RefreshReason::Startup);
            enable(ctx, applied, force).await
        } else if applied || !super::load_gateways(ctx.kvs(), ctx.cluster(), true).await?.is_empty() {
            disable(ctx).await
        } else {
            tracing::debug!("object store is not requested");
            Ok(())
        }
    }
}

async fn enable(ctx: &Context, applied: bool, force: bool) -> Result<()> {
    let nodes: Vec<String> = ctx.inventory.nodes.keys().filter(|node| ctx.is_healthy(node)).cloned().collect();
    let current = super::load_gateways(ctx.kvs(), ctx.cluster(), false).await?;
    let missing = nodes.iter().any(|node| !current.contains(node));
    if applied && !force && !missing {
        tracing::debug!("object store is up to date");
        return Ok(());
    }
    if nodes.is_empty() {
        tracing::warn!("no healthy node to run gateways on");
        return Ok(());
    }

    if super::load_keyring(ctx.kvs(), ctx.cluster()).await?.is_none() {
        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;
        let key = ctx
            .ceph()
            .auth_get_or_create_key(RGW_USERNAME, &RGW_CAPS)
            .await
            .context("error creating gateway key")?;
        super::store_keyring(ctx.kvs(), ctx.cluster(), &keyring::rgw_keyring(&key)).await?;
        tracing::info!("generated gateway keyring");
    }

    for node in nodes.iter() {
        super::set_gateway(ctx.kvs(), ctx.cluster(), node, false).await?;
    }
    tracing::info!(nodes = ?nodes, "starting gateways");
    bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, RGW_SERVICE, nodes.len(), ctx.config().trigger_timeout(nodes.len()))
        .await?
        .ensure(RGW_SERVICE)?;

    for node in nodes.iter() {
        super::set_gateway(ctx.kvs(), ctx.cluster(), node, true).await?;
    }
    super::mark_applied(ctx.kvs(), ctx.cluster()).await?;
    tracing::info!("object store applied");
    Ok(())
}

async fn disable(ctx: &Context) -> Result<()> {
    super::remove_gateways(ctx.kvs(), ctx.cluster(), false).await?;
    let nodes = super::load_gateways(ctx.kvs(), ctx.cluster(), true).await?;
    tracing::info!(nodes = ?nodes, "stopping gateways");
    let outcome = bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, RGW_SERVICE, 0, ctx.config().removal_timeout()).await?;
    if !outcome.timed_out.is_empty() || !outcome.failed.is_empty() {
        tracing::warn!(timed_out = ?outcome.timed_out, failed = ?outcome.failed, "not every gateway confirmed it stopped");
    }
    super::remove_gateways(ctx.kvs(), ctx.cluster(), true).await?;
    super::mark_unapplied(ctx.kvs(), ctx.cluster()).await?;
    tracing::info!("object store removed");
    Ok(())
}
