//! File services and the metadata servers backing them.
//!
//! A file service is requested by writing its pool under the desired `fs` subtree. The leader
//! creates the backing pools and file system, places one MDS for it on a node without one, and
//! tears all of it down again once the request is withdrawn.

mod agent;
mod leader;
#[cfg(test)]
mod mds_test;

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};

use castle_core::kvs::{self, Kvs};
use castle_core::{keys, AppError};

pub use agent::MdsAgent;
pub use leader::MdsLeader;

/// The service name of metadata servers.
pub const MDS_SERVICE: &str = "mds";
/// The key segment of file services.
pub const FS_SERVICE: &str = "fs";
pub const MDS_BINARY: &str = "ceph-mds";

const KEY_POOL: &str = "pool";
const KEY_ID: &str = "id";
const KEY_FILESYSTEM: &str = "filesystem";
const DATA_POOL_SUFFIX: &str = "-data";
const METADATA_POOL_SUFFIX: &str = "-metadata";

/// An MDS placed on a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdsRecord {
    pub node_id: String,
    pub id: u32,
    /// The file system the MDS serves.
    pub filesystem: String,
}

impl MdsRecord {
    /// The cluster entity of the MDS.
    pub fn entity(&self) -> String {
        format!("mds.{}", self.id)
    }
}

/// The data pool of a file system.
pub fn data_pool(filesystem: &str) -> String {
    format!("{}{}", filesystem, DATA_POOL_SUFFIX)
}

/// The metadata pool of a file system.
pub fn metadata_pool(filesystem: &str) -> String {
    format!("{}{}", filesystem, METADATA_POOL_SUFFIX)
}

fn fs_key(cluster: &str, name: &str, applied: bool) -> String {
    let base = if applied {
        keys::applied_key(cluster, FS_SERVICE)
    } else {
        keys::desired_key(cluster, FS_SERVICE)
    };
    keys::join([base.as_str(), name])
}

fn mds_key(cluster: &str, node: &str, applied: bool) -> String {
    if applied {
        keys::applied_node_key(cluster, MDS_SERVICE, node)
    } else {
        keys::desired_node_key(cluster, MDS_SERVICE, node)
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(AppError::ConfigInvalid(format!("invalid {} name {:?}", what, name)).into());
    }
    Ok(())
}

/// Request a file service named `name` on the given pool.
pub async fn add_filesystem(kvs: &dyn Kvs, cluster: &str, name: &str, pool: &str) -> Result<()> {
    validate_name("file system", name)?;
    validate_name("pool", pool)?;
    tracing::info!(filesystem = name, pool, "adding file system to desired state");
    kvs::set_if_changed(kvs, &keys::join([fs_key(cluster, name, false).as_str(), KEY_POOL]), pool).await?;
    Ok(())
}

/// Withdraw the request for a file service, along with the MDS placements serving it.
pub async fn remove_filesystem(kvs: &dyn Kvs, cluster: &str, name: &str) -> Result<()> {
    validate_name("file system", name)?;
    if !load_filesystems(kvs, cluster, false).await?.contains_key(name) {
        return Err(AppError::NotFound(format!("file system {}", name)).into());
    }
    tracing::info!(filesystem = name, "removing file system from desired state");
    kvs.delete(&fs_key(cluster, name, false), true).await?;
    for rec in load_mds(kvs, cluster, false).await?.into_iter().filter(|rec| rec.filesystem == name) {
        remove_mds(kvs, cluster, &rec.node_id, false).await?;
    }
    Ok(())
}

/// The requested or applied file services, with their pools.
pub async fn load_filesystems(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<BTreeMap<String, String>> {
    let base = if applied {
        keys::applied_key(cluster, FS_SERVICE)
    } else {
        keys::desired_key(cluster, FS_SERVICE)
    };
    let tree = kvs.get_tree(&base).await?;
    Ok(tree
        .into_iter()
        .filter_map(|(key, pool)| {
            let name = key.strip_suffix(&format!("/{}", KEY_POOL))?;
            (!name.contains('/')).then(|| (name.to_string(), pool))
        })
        .collect())
}

async fn mark_filesystem_applied(kvs: &dyn Kvs, cluster: &str, name: &str, pool: &str) -> Result<()> {
    kvs::set_if_changed(kvs, &keys::join([fs_key(cluster, name, true).as_str(), KEY_POOL]), pool).await?;
    Ok(())
}

async fn mark_filesystem_unapplied(kvs: &dyn Kvs, cluster: &str, name: &str) -> Result<()> {
    kvs.delete(&fs_key(cluster, name, true), true).await
}

/// Every desired or applied MDS, in node order.
pub async fn load_mds(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<Vec<MdsRecord>> {
    let base = if applied {
        keys::applied_key(cluster, MDS_SERVICE)
    } else {
        keys::desired_key(cluster, MDS_SERVICE)
    };
    let tree = kvs.get_tree(&base).await?;
    let mut records = vec![];
    for node_id in kvs.list_children(&base).await? {
        let id = match tree.get(&format!("{}/{}", node_id, KEY_ID)) {
            Some(id) => id.parse().with_context(|| format!("invalid mds id {:?} on node {}", id, node_id))?,
            None => continue,
        };
        let filesystem = tree.get(&format!("{}/{}", node_id, KEY_FILESYSTEM)).cloned().unwrap_or_default();
        records.push(MdsRecord { node_id, id, filesystem });
    }
    Ok(records)
}

/// The MDS placed on the given node, if its record is complete.
pub async fn load_node_mds(kvs: &dyn Kvs, cluster: &str, node: &str) -> Result<Option<MdsRecord>> {
    let tree = kvs.get_tree(&mds_key(cluster, node, false)).await?;
    let (id, filesystem) = match (tree.get(KEY_ID), tree.get(KEY_FILESYSTEM)) {
        (Some(id), Some(filesystem)) => (id, filesystem),
        _ => return Ok(None),
    };
    let id = id.parse().with_context(|| format!("invalid mds id {:?} on node {}", id, node))?;
    Ok(Some(MdsRecord {
        node_id: node.to_string(),
        id,
        filesystem: filesystem.clone(),
    }))
}

async fn store_mds(kvs: &dyn Kvs, cluster: &str, rec: &MdsRecord, applied: bool) -> Result<()> {
    let base = mds_key(cluster, &rec.node_id, applied);
    kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_ID]), &rec.id.to_string()).await?;
    kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_FILESYSTEM]), &rec.filesystem).await?;
    Ok(())
}

async fn remove_mds(kvs: &dyn Kvs, cluster: &str, node: &str, applied: bool) -> Result<()> {
    kvs.delete(&mds_key(cluster, node, applied), true).await
}
