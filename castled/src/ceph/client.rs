//! A client of the cluster admin tool.
//!
//! Every call runs `ceph <args> --cluster=<name> --conf=<path> --keyring=<path> --name=<user>
//! --format json` through the host executor.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::ceph::config;
use crate::ceph::keyring::ADMIN_USERNAME;
use crate::config::Config;
use crate::exec::{args, DynExecutor};

/// The placement group count of pools created for file services.
const DEFAULT_PG_COUNT: &str = "100";

/// The output of `mon_status`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MonStatus {
    #[serde(default)]
    pub quorum: Vec<u32>,
    pub monmap: MonMap,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MonMap {
    #[serde(default)]
    pub mons: Vec<MonMapEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MonMapEntry {
    pub name: String,
    pub rank: u32,
}

impl MonStatus {
    /// Check if the named monitor is in the monitor map and its rank is part of the quorum.
    pub fn in_quorum(&self, name: &str) -> bool {
        self.monmap
            .mons
            .iter()
            .find(|mon| mon.name == name)
            .map(|mon| self.quorum.contains(&mon.rank))
            .unwrap_or(false)
    }
}

/// The output of `fs get`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FsDetails {
    pub mdsmap: MdsMap,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MdsMap {
    /// Active MDS daemons keyed by `gid_<n>`.
    #[serde(default)]
    pub info: std::collections::BTreeMap<String, MdsInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MdsInfo {
    pub gid: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct OsdCreateOutput {
    osdid: u32,
}

#[derive(Debug, Deserialize)]
struct AuthKeyOutput {
    key: String,
}

#[derive(Debug, Deserialize)]
struct FsListEntry {
    name: String,
}

/// A connection to the cluster as one identity.
#[derive(Clone)]
pub struct CephClient {
    executor: DynExecutor,
    binary: String,
    cluster: String,
    conf: PathBuf,
    keyring: PathBuf,
    user: String,
}

impl CephClient {
    /// A client using the node's admin connection config.
    pub fn admin(config: &Config, executor: DynExecutor) -> Self {
        let root = config::admin_root(config);
        Self {
            executor,
            binary: config.ceph_binary.clone(),
            cluster: config.cluster_name.clone(),
            conf: config::conf_file_path(&root, &config.cluster_name),
            keyring: config::admin_keyring_path(config),
            user: ADMIN_USERNAME.into(),
        }
    }

    /// A copy of this client acting as another identity.
    pub fn with_user(&self, user: &str, keyring: &Path) -> Self {
        Self {
            user: config::qualified_user(user),
            keyring: keyring.to_path_buf(),
            ..self.clone()
        }
    }

    /// Run the given admin command, returning its stdout.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn run(&self, cmd: &[String]) -> Result<String> {
        let mut full = cmd.to_vec();
        full.push(format!("--cluster={}", self.cluster));
        full.push(format!("--conf={}", self.conf.display()));
        full.push(format!("--keyring={}", self.keyring.display()));
        full.push(format!("--name={}", self.user));
        full.extend(args(["--format", "json"]));
        self.executor.execute(&self.binary, &full).await
    }

    async fn run_json<T: serde::de::DeserializeOwned>(&self, cmd: &[String]) -> Result<T> {
        let output = self.run(cmd).await?;
        serde_json::from_str(&output).with_context(|| format!("error decoding output of `{}`: {:?}", cmd.join(" "), output))
    }

    pub async fn mon_status(&self) -> Result<MonStatus> {
        self.run_json(&args(["mon_status"])).await
    }

    pub async fn mon_remove(&self, name: &str) -> Result<()> {
        self.run(&args(["mon", "remove", name])).await.map(|_| ())
    }

    /// Write the current monitor map to `path`.
    pub async fn mon_getmap(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.run(&args(["mon", "getmap", "-o", path.as_str()])).await.map(|_| ())
    }

    /// Register a new OSD with the given uuid, returning its id. Registering an existing uuid
    /// returns the id it already has.
    pub async fn osd_create(&self, uuid: &str) -> Result<u32> {
        let out: OsdCreateOutput = self.run_json(&args(["osd", "create", uuid])).await?;
        Ok(out.osdid)
    }

    /// Import the key in `keyring` for `entity` with the given caps, given as
    /// `[service, capability, ..]` pairs.
    pub async fn auth_add(&self, entity: &str, keyring: &Path, caps: &[&str]) -> Result<()> {
        let keyring = keyring.to_string_lossy().into_owned();
        let mut cmd = args(["auth", "add", entity, "-i", keyring.as_str()]);
        cmd.extend(args(caps.iter().copied()));
        self.run(&cmd).await.map(|_| ())
    }

    pub async fn auth_get_or_create_key(&self, entity: &str, caps: &[&str]) -> Result<String> {
        let mut cmd = args(["auth", "get-or-create-key", entity]);
        cmd.extend(args(caps.iter().copied()));
        let out: AuthKeyOutput = self.run_json(&cmd).await?;
        Ok(out.key)
    }

    pub async fn auth_del(&self, entity: &str) -> Result<()> {
        self.run(&args(["auth", "del", entity])).await.map(|_| ())
    }

    pub async fn osd_crush_create_or_move(&self, id: u32, weight: f64, location: &[String]) -> Result<()> {
        let mut cmd = args(["osd", "crush", "create-or-move"]);
        cmd.push(format!("osd.{}", id));
        cmd.push(crate::osd::crush::format_weight(weight));
        cmd.extend(location.iter().cloned());
        self.run(&cmd).await.map(|_| ())
    }

    pub async fn osd_crush_remove(&self, name: &str) -> Result<()> {
        self.run(&args(["osd", "crush", "remove", name])).await.map(|_| ())
    }

    pub async fn osd_out(&self, id: u32) -> Result<()> {
        self.run(&args(["osd".to_string(), "out".to_string(), id.to_string()])).await.map(|_| ())
    }

    pub async fn osd_rm(&self, id: u32) -> Result<()> {
        self.run(&args(["osd".to_string(), "rm".to_string(), id.to_string()])).await.map(|_| ())
    }

    pub async fn pool_create(&self, name: &str) -> Result<()> {
        self.run(&args(["osd", "pool", "create", name, DEFAULT_PG_COUNT])).await.map(|_| ())
    }

    /// The names of every file system in the cluster.
    pub async fn fs_list(&self) -> Result<Vec<String>> {
        let out: Vec<FsListEntry> = self.run_json(&args(["fs", "ls"])).await?;
        Ok(out.into_iter().map(|fs| fs.name).collect())
    }

    pub async fn fs_new(&self, name: &str, metadata_pool: &str, data_pool: &str) -> Result<()> {
        self.run(&args(["fs", "new", name, metadata_pool, data_pool])).await.map(|_| ())
    }

    pub async fn fs_get(&self, name: &str) -> Result<FsDetails> {
        self.run_json(&args(["fs", "get", name])).await
    }

    pub async fn fs_set_cluster_down(&self, name: &str) -> Result<()> {
        self.run(&args(["fs", "set", name, "cluster_down", "true"])).await.map(|_| ())
    }

    pub async fn mds_fail(&self, gid: u64) -> Result<()> {
        self.run(&args(["mds".to_string(), "fail".to_string(), gid.to_string()])).await.map(|_| ())
    }

    pub async fn fs_rm(&self, name: &str) -> Result<()> {
        self.run(&args(["fs", "rm", name, "--yes-i-really-mean-it"])).await.map(|_| ())
    }

    /// Create the default CRUSH root and the replicated rule placing replicas across hosts.
    pub async fn create_default_crush_map(&self) -> Result<()> {
        self.run(&args(["osd", "crush", "add-bucket", "default", "root"]))
            .await
            .context("error creating default crush root")?;
        self.run(&args(["osd", "crush", "rule", "create-simple", "replicated_ruleset", "default", "host", "firstn"]))
            .await
            .context("error creating default crush rule")?;
        Ok(())
    }
}
