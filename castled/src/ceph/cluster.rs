//! Cluster identity and monitor membership.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::ceph::keyring;
use castle_core::keys;
use castle_core::kvs::Kvs;

/// The service name of monitors, which is also their key segment.
pub const MONITOR_SERVICE: &str = "monitor";
/// The port every monitor listens on.
pub const MON_PORT: u16 = 6790;

const KEY_FSID: &str = "fsid";
const KEY_NAME: &str = "name";
const KEY_SECRETS: &str = "_secrets";
const KEY_MONITOR_SECRET: &str = "monitor";
const KEY_ADMIN_SECRET: &str = "admin";
const KEY_MON_ID: &str = "id";
const KEY_MON_IP: &str = "ipaddress";
const KEY_MON_PORT: &str = "port";

/// A monitor as seen by its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// The monitor name, `mon<N>`.
    pub name: String,
    /// `<ip>:<port>`
    pub endpoint: String,
}

/// A monitor record as stored under a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorRecord {
    pub node_id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl MonitorRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// The numeric part of the monitor name.
    pub fn index(&self) -> Option<u32> {
        self.name.strip_prefix("mon").and_then(|idx| idx.parse().ok())
    }
}

/// The identity of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub fsid: String,
    pub name: String,
    pub monitor_secret: String,
    pub admin_secret: String,
    /// The desired monitors, keyed by node id.
    pub monitors: BTreeMap<String, MonitorConfig>,
}

impl ClusterInfo {
    /// Load the identity of the given cluster, `None` if it was never created.
    ///
    /// The identity fields are written together; finding only some of them is an error.
    pub async fn load(kvs: &dyn Kvs, cluster: &str) -> Result<Option<Self>> {
        let root = keys::cluster_root(cluster);
        let fsid = kvs.get(&keys::join([root.as_str(), KEY_FSID])).await?;
        let name = kvs.get(&keys::join([root.as_str(), KEY_NAME])).await?;
        let monitor_secret = kvs.get(&keys::join([root.as_str(), KEY_SECRETS, KEY_MONITOR_SECRET])).await?;
        let admin_secret = kvs.get(&keys::join([root.as_str(), KEY_SECRETS, KEY_ADMIN_SECRET])).await?;

        let (fsid, name, monitor_secret, admin_secret) = match (fsid, name, monitor_secret, admin_secret) {
            (None, None, None, None) => return Ok(None),
            (Some(fsid), Some(name), Some(monitor_secret), Some(admin_secret)) => (fsid, name, monitor_secret, admin_secret),
            _ => bail!("identity of cluster {} is only partially written", cluster),
        };

        let monitors = load_monitors(kvs, cluster, false)
            .await?
            .into_iter()
            .map(|rec| {
                let conf = MonitorConfig {
                    endpoint: rec.endpoint(),
                    name: rec.name,
                };
                (rec.node_id, conf)
            })
            .collect();
        Ok(Some(Self {
            fsid,
            name,
            monitor_secret,
            admin_secret,
            monitors,
        }))
    }

    /// Load the identity of the given cluster, which must exist.
    pub async fn must_load(kvs: &dyn Kvs, cluster: &str) -> Result<Self> {
        Self::load(kvs, cluster)
            .await?
            .with_context(|| format!("identity of cluster {} has not been created", cluster))
    }

    /// Load the identity of the given cluster, creating it first if needed. An empty
    /// `admin_secret` is generated.
    pub async fn create_or_load(kvs: &dyn Kvs, cluster: &str, admin_secret: &str) -> Result<Self> {
        if let Some(info) = Self::load(kvs, cluster).await? {
            return Ok(info);
        }

        tracing::info!(cluster, "creating cluster identity");
        let admin_secret = if admin_secret.is_empty() {
            keyring::generate_key()
        } else {
            admin_secret.to_string()
        };
        let info = Self {
            fsid: Uuid::new_v4().to_string(),
            name: cluster.to_string(),
            monitor_secret: keyring::generate_key(),
            admin_secret,
            monitors: BTreeMap::new(),
        };

        // The fsid goes last so that a partial write is detected on the next load.
        let root = keys::cluster_root(cluster);
        kvs.set(&keys::join([root.as_str(), KEY_NAME]), &info.name).await?;
        kvs.set(&keys::join([root.as_str(), KEY_SECRETS, KEY_MONITOR_SECRET]), &info.monitor_secret)
            .await?;
        kvs.set(&keys::join([root.as_str(), KEY_SECRETS, KEY_ADMIN_SECRET]), &info.admin_secret)
            .await?;
        kvs.set(&keys::join([root.as_str(), KEY_FSID]), &info.fsid).await?;
        Ok(info)
    }

    /// The monitor hosted on the given node.
    pub fn monitor_on(&self, node_id: &str) -> Option<&MonitorConfig> {
        self.monitors.get(node_id)
    }
}

/// Load the desired or applied monitor records of the given cluster.
pub async fn load_monitors(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<Vec<MonitorRecord>> {
    let dir = if applied {
        keys::applied_key(cluster, MONITOR_SERVICE)
    } else {
        keys::desired_key(cluster, MONITOR_SERVICE)
    };
    let mut records = vec![];
    for node_id in kvs.list_children(&dir).await? {
        let tree = kvs.get_tree(&keys::join([dir.as_str(), node_id.as_str()])).await?;
        let name = tree.get(KEY_MON_ID).cloned().unwrap_or_default();
        let ip = tree.get(KEY_MON_IP).cloned().unwrap_or_default();
        if name.is_empty() || ip.is_empty() {
            tracing::warn!(node = %node_id, "skipping incomplete monitor record");
            continue;
        }
        let port = match tree.get(KEY_MON_PORT).map(|port| port.parse::<u16>()) {
            Some(Ok(port)) => port,
            Some(Err(err)) => bail!("invalid port in monitor record of node {}: {}", node_id, err),
            None => MON_PORT,
        };
        records.push(MonitorRecord { node_id, name, ip, port });
    }
    Ok(records)
}

/// Write a monitor record under the desired or applied state.
pub async fn store_monitor(kvs: &dyn Kvs, cluster: &str, rec: &MonitorRecord, applied: bool) -> Result<()> {
    let base = if applied {
        keys::applied_node_key(cluster, MONITOR_SERVICE, &rec.node_id)
    } else {
        keys::desired_node_key(cluster, MONITOR_SERVICE, &rec.node_id)
    };
    castle_core::kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_MON_ID]), &rec.name).await?;
    castle_core::kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_MON_IP]), &rec.ip).await?;
    castle_core::kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_MON_PORT]), &rec.port.to_string()).await?;
    Ok(())
}
