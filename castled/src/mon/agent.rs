use std::collections::HashMap;

use anyhow::{Context as _, Result};
use tokio::sync::Mutex;

use super::{data_dir, keyring_path, run_dir, MON_BINARY};
use crate::ceph::cluster::{ClusterInfo, MONITOR_SERVICE};
use crate::ceph::config::{self as ceph_config, ConfigOptions};
use crate::ceph::keyring;
use crate::context::Context;
use crate::exec::args;
use crate::proc::{ProcHandle, StartPolicy};
use crate::service::ServiceAgent;

/// The agent running this node's monitor.
#[derive(Default)]
pub struct MonAgent {
    /// Running monitors by name.
    procs: Mutex<HashMap<String, ProcHandle>>,
}

#[async_trait::async_trait]
impl ServiceAgent for MonAgent {
    fn name(&self) -> &'static str {
        MONITOR_SERVICE
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    async fn configure(&self, ctx: &Context) -> Result<()> {
        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        let mon = cluster
            .monitor_on(ctx.node_id())
            .with_context(|| format!("no complete monitor record for node {}", ctx.node_id()))?
            .clone();
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;

        // A monitor moved off this node is no longer ours to run.
        let mut procs = self.procs.lock().await;
        let stale: Vec<String> = procs.keys().filter(|name| **name != mon.name).cloned().collect();
        for name in stale {
            if let Some(handle) = procs.remove(&name) {
                tracing::info!(monitor = %name, "stopping monitor no longer desired here");
                ctx.supervisor().stop(&handle).await?;
            }
        }

        let root = &ctx.config().config_root;
        let (run_dir, keyring_path, data_dir) = (run_dir(root, &mon.name), keyring_path(root, &mon.name), data_dir(root, &mon.name));
        keyring::write_keyring(&keyring_path, &keyring::monitor_keyring(&cluster.monitor_secret, &cluster.admin_secret)).await?;
        let user = format!("mon.{}", mon.name);
        let conf = ceph_config::generate_config_file(
            ctx.config(),
            &cluster,
            ConfigOptions {
                root: &run_dir,
                user: &user,
                keyring: &keyring_path,
                store_type: ctx.config().store_type,
                global: vec![],
                client: vec![],
            },
        )
        .await?;

        let common = args([
            format!("--cluster={}", cluster.name),
            format!("--name={}", user),
            format!("--mon-data={}", data_dir.display()),
            format!("--conf={}", conf.display()),
            format!("--keyring={}", keyring_path.display()),
        ]);
        if !ctx.executor().stat(&data_dir).await? {
            tracing::info!(monitor = %mon.name, "creating monitor filesystem");
            let mut mkfs = vec!["--mkfs".to_string()];
            mkfs.extend(common.iter().cloned());
            ctx.supervisor().run(&format!("{} mkfs", user), MON_BINARY, &mkfs).await?;
        }

        if procs.contains_key(&mon.name) {
            return Ok(());
        }
        let mut daemon = vec!["--foreground".to_string()];
        daemon.extend(common);
        daemon.push(format!("--public-addr={}", mon.endpoint));
        let signature = regex::escape(&format!("--name={}", user));
        if let Some(handle) = ctx.supervisor().start(&user, MON_BINARY, &signature, StartPolicy::ReuseExisting, &daemon).await? {
            tracing::info!(monitor = %mon.name, endpoint = %mon.endpoint, "started monitor");
            procs.insert(mon.name.clone(), handle);
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &Context) -> Result<()> {
        let mut procs = self.procs.lock().await;
        for (name, handle) in procs.drain() {
            tracing::info!(monitor = %name, "stopping monitor");
            ctx.supervisor().stop(&handle).await?;
        }
        Ok(())
    }
}
