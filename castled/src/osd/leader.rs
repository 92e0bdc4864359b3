use anyhow::Result;

use super::OSD_SERVICE;
use crate::bus::{self, RefreshEvent, RefreshReason};
use crate::context::Context;
use crate::service::ServiceLeader;
use castle_core::{keys, kvs};

/// The leader of the OSD service.
///
/// Nodes publish the OSDs they offer themselves; the leader marks every healthy node offering
/// any as ready and waits for more than half of them to finish. Nodes which offer none but still
/// have applied OSDs are triggered as well so that they retire them.
#[derive(Default)]
pub struct OsdLeader;

#[async_trait::async_trait]
impl ServiceLeader for OsdLeader {
    fn name(&self) -> &'static str {
        OSD_SERVICE
    }

    fn refresh_keys(&self, cluster: &str) -> Vec<String> {
        vec![keys::desired_key(cluster, OSD_SERVICE)]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, event))]
    async fn configure(&self, ctx: &Context, event: &RefreshEvent) -> Result<()> {
        let mut nodes = vec![];
        let mut changed = false;
        for node_id in ctx.inventory.nodes.keys() {
            let tree = ctx.kvs().get_tree(&keys::desired_node_key(ctx.cluster(), OSD_SERVICE, node_id)).await?;
            let wants = super::wants_osds(&tree);
            // Nodes still running OSDs they no longer want are triggered to retire them.
            let retiring = !wants && tree.contains_key(super::KEY_READY) && !super::load_applied(ctx.kvs(), ctx.cluster(), node_id).await?.is_empty();
            if !wants && !retiring {
                continue;
            }
            if !ctx.is_healthy(node_id) {
                tracing::warn!(node = %node_id, "skipping osds of unhealthy node");
                continue;
            }
            if wants {
                changed |= kvs::set_if_changed(ctx.kvs(), &super::ready_key(ctx.cluster(), node_id), keys::MARKER_SET).await?;
            }
            changed |= retiring;
            nodes.push(node_id.clone());
        }

        if nodes.is_empty() {
            tracing::debug!("no node offers osds");
            return Ok(());
        }
        if !changed && !matches!(event.reason, RefreshReason::Manual | RefreshReason::Startup) {
            tracing::debug!("osd nodes are up to date");
            return Ok(());
        }

        let required = osd_quorum(nodes.len());
        tracing::info!(nodes = ?nodes, required, "configuring osds");
        bus::trigger_and_wait(ctx.kvs(), ctx.cluster(), &nodes, OSD_SERVICE, required, ctx.config().trigger_timeout(nodes.len()))
            .await?
            .ensure(OSD_SERVICE)
    }
}

/// The number of OSD nodes which must succeed for a pass to count: `ceil(n/2) + 1`, capped at `n`.
pub(super) fn osd_quorum(nodes: usize) -> usize {
    ((nodes + 1) / 2 + 1).min(nodes)
}
