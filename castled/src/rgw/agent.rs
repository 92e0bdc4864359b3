use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::sync::Mutex;

use super::{RGW_BINARY, RGW_PORT, RGW_SERVICE};
use crate::ceph::cluster::ClusterInfo;
use crate::ceph::config::{self as ceph_config, ConfigOptions};
use crate::ceph::keyring::{self, RGW_USERNAME};
use crate::context::Context;
use crate::exec::args;
use crate::proc::{ProcHandle, StartPolicy};
use crate::service::ServiceAgent;
use castle_core::AppError;

/// The content types the gateway serves objects with.
const MIME_TYPES: &str = "\
application/json\t\tjson
application/octet-stream\tbin
application/pdf\t\t\tpdf
application/xml\t\t\txml
application/zip\t\t\tzip
image/gif\t\t\tgif
image/jpeg\t\t\tjpeg jpg
image/png\t\t\tpng
text/css\t\t\tcss
text/html\t\t\thtml htm
text/plain\t\t\ttxt
";

/// The directory of the gateway's files, `<config_root>/rgw`.
pub fn rgw_root(config_root: &str) -> PathBuf {
    Path::new(config_root).join(RGW_SERVICE)
}

/// The agent running this node's object gateway.
#[derive(Default)]
pub struct RgwAgent {
    proc: Mutex<Option<ProcHandle>>,
}

#[async_trait::async_trait]
impl ServiceAgent for RgwAgent {
    fn name(&self) -> &'static str {
        RGW_SERVICE
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    async fn configure(&self, ctx: &Context) -> Result<()> {
        let contents = super::load_keyring(ctx.kvs(), ctx.cluster())
            .await?
            .ok_or_else(|| AppError::NotFound("object store keyring".into()))?;
        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;

        let root = rgw_root(&ctx.config().config_root);
        let keyring_path = root.join("keyring");
        keyring::write_keyring(&keyring_path, &contents).await?;
        let data_dir = root.join("data");
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("error creating gateway data dir {}", data_dir.display()))?;
        let mime_types = root.join("mime.types");
        tokio::fs::write(&mime_types, MIME_TYPES)
            .await
            .with_context(|| format!("error writing {}", mime_types.display()))?;

        let level = ceph_config::debug_level(&ctx.config().log_level).to_string();
        let conf = ceph_config::generate_config_file(
            ctx.config(),
            &cluster,
            ConfigOptions {
                root: &root,
                user: RGW_USERNAME,
                keyring: &keyring_path,
                store_type: ctx.config().store_type,
                global: vec![],
                client: vec![
                    ("host".into(), ctx.node_id().to_string()),
                    ("rgw port".into(), RGW_PORT.to_string()),
                    ("rgw frontends".into(), format!("civetweb port={}", RGW_PORT)),
                    ("rgw data".into(), data_dir.display().to_string()),
                    ("rgw mime types file".into(), mime_types.display().to_string()),
                    ("debug rgw".into(), level),
                ],
            },
        )
        .await?;

        let mut proc = self.proc.lock().await;
        if proc.is_some() {
            return Ok(());
        }
        let name_arg = format!("--name={}", RGW_USERNAME);
        let daemon = args([
            "--foreground".to_string(),
            format!("--cluster={}", cluster.name),
            format!("--conf={}", conf.display()),
            format!("--keyring={}", keyring_path.display()),
            name_arg.clone(),
        ]);
        let signature = regex::escape(&name_arg);
        if let Some(handle) = ctx.supervisor().start(RGW_USERNAME, RGW_BINARY, &signature, StartPolicy::ReuseExisting, &daemon).await? {
            tracing::info!(port = RGW_PORT, "started gateway");
            *proc = Some(handle);
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &Context) -> Result<()> {
        if let Some(handle) = self.proc.lock().await.take() {
            tracing::info!("stopping gateway");
            ctx.supervisor().stop(&handle).await?;
        }
        Ok(())
    }
}
