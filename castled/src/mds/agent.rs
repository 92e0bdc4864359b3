use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::sync::Mutex;

use super::{MDS_BINARY, MDS_SERVICE};
use crate::ceph::cluster::ClusterInfo;
use crate::ceph::config::{self as ceph_config, ConfigOptions};
use crate::ceph::keyring;
use crate::context::Context;
use crate::exec::args;
use crate::proc::{ProcHandle, StartPolicy};
use crate::service::ServiceAgent;

const MDS_CAPS: [&str; 6] = ["osd", "allow *", "mon", "allow profile mds", "mds", "allow"];

/// The agent running the MDS placed on this node.
#[derive(Default)]
pub struct MdsAgent {
    /// Running MDS daemons by id.
    procs: Mutex<HashMap<u32, ProcHandle>>,
}

#[async_trait::async_trait]
impl ServiceAgent for MdsAgent {
    fn name(&self) -> &'static str {
        MDS_SERVICE
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    async fn configure(&self, ctx: &Context) -> Result<()> {
        let mds = super::load_node_mds(ctx.kvs(), ctx.cluster(), ctx.node_id())
            .await?
            .with_context(|| format!("no complete mds record for node {}", ctx.node_id()))?;
        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;

        let mut procs = self.procs.lock().await;
        let stale: Vec<u32> = procs.keys().filter(|id| **id != mds.id).copied().collect();
        for id in stale {
            if let Some(handle) = procs.remove(&id) {
                tracing::info!(mds = id, "stopping mds no longer placed here");
                ctx.supervisor().stop(&handle).await?;
            }
        }

        let entity = mds.entity();
        let root = Path::new(&ctx.config().config_root).join(format!("mds{}", mds.id));
        let keyring_path = root.join("keyring");
        let id = mds.id.to_string();
        keyring::create_keyring(&ctx.ceph(), &keyring_path, &entity, &MDS_CAPS, |key| keyring::mds_keyring(&id, key))
            .await
            .with_context(|| format!("error creating keyring of {}", entity))?;
        let conf = ceph_config::generate_config_file(
            ctx.config(),
            &cluster,
            ConfigOptions {
                root: &root,
                user: &entity,
                keyring: &keyring_path,
                store_type: ctx.config().store_type,
                global: vec![],
                client: vec![],
            },
        )
        .await?;

        if procs.contains_key(&mds.id) {
            return Ok(());
        }
        let id_arg = format!("--id={}", mds.id);
        let daemon = args([
            "--foreground".to_string(),
            format!("--cluster={}", cluster.name),
            format!("--conf={}", conf.display()),
            format!("--keyring={}", keyring_path.display()),
            id_arg.clone(),
        ]);
        let signature = format!("{}( |$)", regex::escape(&id_arg));
        if let Some(handle) = ctx.supervisor().start(&entity, MDS_BINARY, &signature, StartPolicy::ReuseExisting, &daemon).await? {
            tracing::info!(mds = mds.id, filesystem = %mds.filesystem, "started mds");
            procs.insert(mds.id, handle);
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &Context) -> Result<()> {
        let mut procs = self.procs.lock().await;
        for (id, handle) in procs.drain() {
            tracing::info!(mds = id, "stopping mds");
            ctx.supervisor().stop(&handle).await?;
        }
        Ok(())
    }
}
