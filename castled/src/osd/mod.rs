//! The OSD service.
//!
//! OSDs are backed either by whole devices, partitioned according to the node's partition
//! scheme, or by directories. The leader only marks nodes ready; registering OSDs with the
//! cluster and recording their ids in the desired state is the agent's job.

mod agent;
pub mod crush;
mod device;
mod leader;
pub mod scheme;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;

use castle_core::keys;
use castle_core::kvs::{self, Kvs};

pub use agent::OsdAgent;
pub use leader::OsdLeader;

/// The service name of OSDs, which is also their key segment.
pub const OSD_SERVICE: &str = "osd";
/// The binary of the OSD daemon.
pub const OSD_BINARY: &str = "ceph-osd";

const KEY_DEVICE: &str = "device";
const KEY_DIR: &str = "dir";
const KEY_READY: &str = "ready";
/// The device spec a node claims devices with.
const KEY_DEVICES: &str = "devices";
const KEY_OSD_ID_DATA: &str = "osd-id-data";
const KEY_OSD_ID_METADATA: &str = "osd-id-metadata";
const KEY_PATH: &str = "path";
const KEY_DATA_DISK_UUID: &str = "data-disk-uuid";
const KEY_METADATA_DISK_UUID: &str = "metadata-disk-uuid";

/// The OSD ids stored on a desired device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceMapping {
    /// The OSD whose data lives on the device.
    pub data: Option<u32>,
    /// The OSDs whose metadata lives on the device. `Some(vec![])` marks a device reserved for
    /// metadata which holds nothing yet.
    pub metadata: Option<Vec<u32>>,
}

impl DeviceMapping {
    /// Check if the device still needs a data partition, possibly with collocated metadata.
    pub fn wants_data(&self) -> bool {
        match (self.data, &self.metadata) {
            (None, None) => true,
            (Some(_), Some(ids)) => ids.len() == 1,
            _ => false,
        }
    }

    /// Check if the device is reserved for the metadata of other OSDs and still empty.
    pub fn wants_metadata(&self) -> bool {
        self.data.is_none() && matches!(&self.metadata, Some(ids) if ids.is_empty())
    }
}

/// An OSD recorded as applied on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppliedOsd {
    pub path: String,
    pub data_disk_uuid: String,
    pub metadata_disk_uuid: String,
}

/// `<config_root>/osd<id>`, the data dir of an OSD.
pub fn osd_root(config_root: &Path, id: u32) -> PathBuf {
    config_root.join(format!("osd{}", id))
}

/// The marker the leader sets once a node may configure its OSDs.
pub fn ready_key(cluster: &str, node: &str) -> String {
    keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_READY])
}

fn devices_claim_key(cluster: &str, node: &str) -> String {
    keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_DEVICES])
}

fn device_key(cluster: &str, node: &str, disk_uuid: &str) -> String {
    keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_DEVICE, disk_uuid])
}

fn dir_key(cluster: &str, node: &str, dir: &str) -> String {
    keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_DIR, keys::escape_path(dir).as_str()])
}

fn applied_osd_key(cluster: &str, node: &str, id: u32) -> String {
    keys::join([keys::applied_node_key(cluster, OSD_SERVICE, node), id.to_string()])
}

/// Add a directory OSD to the desired state of the given node.
pub async fn add_desired_dir(kvs: &dyn Kvs, cluster: &str, node: &str, dir: &str) -> Result<()> {
    kvs::set_if_changed(kvs, &keys::join([dir_key(cluster, node, dir).as_str(), KEY_PATH]), dir).await?;
    Ok(())
}

/// Drop a directory OSD from the desired state; the agent retires it on its next pass.
pub async fn remove_desired_dir(kvs: &dyn Kvs, cluster: &str, node: &str, dir: &str) -> Result<()> {
    kvs.delete(&dir_key(cluster, node, dir), true).await
}

/// Drop a device from the desired state; the agent retires its OSD on its next pass.
pub async fn remove_desired_device(kvs: &dyn Kvs, cluster: &str, node: &str, disk_uuid: &str) -> Result<()> {
    kvs.delete(&device_key(cluster, node, disk_uuid), true).await
}

/// Record the OSD whose data lives on the given desired device.
async fn associate_device(kvs: &dyn Kvs, cluster: &str, node: &str, disk_uuid: &str, id: u32) -> Result<()> {
    let key = keys::join([device_key(cluster, node, disk_uuid).as_str(), KEY_OSD_ID_DATA]);
    kvs::set_if_changed(kvs, &key, &id.to_string()).await?;
    Ok(())
}

/// Record the OSDs whose metadata lives on the given desired device, as a comma list.
async fn associate_metadata(kvs: &dyn Kvs, cluster: &str, node: &str, disk_uuid: &str, ids: &str) -> Result<()> {
    let key = keys::join([device_key(cluster, node, disk_uuid).as_str(), KEY_OSD_ID_METADATA]);
    kvs::set_if_changed(kvs, &key, ids).await?;
    Ok(())
}

async fn associate_dir(kvs: &dyn Kvs, cluster: &str, node: &str, dir: &str, id: u32) -> Result<()> {
    let key = keys::join([dir_key(cluster, node, dir).as_str(), KEY_OSD_ID_DATA]);
    kvs::set_if_changed(kvs, &key, &id.to_string()).await?;
    Ok(())
}

/// The desired directory OSDs of a node, by path, along with their ids once registered.
pub async fn load_desired_dirs(kvs: &dyn Kvs, cluster: &str, node: &str) -> Result<BTreeMap<String, Option<u32>>> {
    let base = keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_DIR]);
    let tree = kvs.get_tree(&base).await?;
    let mut dirs = BTreeMap::new();
    for escaped in kvs.list_children(&base).await? {
        let path = match tree.get(&format!("{}/{}", escaped, KEY_PATH)) {
            Some(path) if !path.is_empty() => path.clone(),
            _ => continue,
        };
        let id = tree.get(&format!("{}/{}", escaped, KEY_OSD_ID_DATA)).and_then(|id| parse_id(id, &path));
        dirs.insert(path, id);
    }
    Ok(dirs)
}

/// The desired devices of a node recorded in the store, by disk uuid.
pub async fn load_desired_devices(kvs: &dyn Kvs, cluster: &str, node: &str) -> Result<BTreeMap<String, DeviceMapping>> {
    let base = keys::join([keys::desired_node_key(cluster, OSD_SERVICE, node).as_str(), KEY_DEVICE]);
    let tree = kvs.get_tree(&base).await?;
    let mut devices = BTreeMap::new();
    for disk_uuid in kvs.list_children(&base).await? {
        let data = tree
            .get(&format!("{}/{}", disk_uuid, KEY_OSD_ID_DATA))
            .and_then(|id| parse_id(id, &disk_uuid));
        let metadata = tree.get(&format!("{}/{}", disk_uuid, KEY_OSD_ID_METADATA)).map(|ids| {
            crate::config::split_list(ids)
                .iter()
                .filter_map(|id| parse_id(id, &disk_uuid))
                .collect()
        });
        devices.insert(disk_uuid, DeviceMapping { data, metadata });
    }
    Ok(devices)
}

fn parse_id(val: &str, owner: &str) -> Option<u32> {
    match val.trim().parse() {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(error = %err, owner, val, "invalid osd id");
            None
        }
    }
}

/// The OSDs recorded as applied on a node, by id.
pub async fn load_applied(kvs: &dyn Kvs, cluster: &str, node: &str) -> Result<BTreeMap<u32, AppliedOsd>> {
    let base = keys::applied_node_key(cluster, OSD_SERVICE, node);
    let tree = kvs.get_tree(&base).await?;
    let mut osds = BTreeMap::new();
    for child in kvs.list_children(&base).await? {
        let id = match child.parse::<u32>() {
            Ok(id) => id,
            Err(_) => continue,
        };
        let field = |name: &str| tree.get(&format!("{}/{}", child, name)).cloned().unwrap_or_default();
        osds.insert(
            id,
            AppliedOsd {
                path: field(KEY_PATH),
                data_disk_uuid: field(KEY_DATA_DISK_UUID),
                metadata_disk_uuid: field(KEY_METADATA_DISK_UUID),
            },
        );
    }
    Ok(osds)
}

async fn store_applied(kvs: &dyn Kvs, cluster: &str, node: &str, id: u32, osd: &AppliedOsd) -> Result<()> {
    let base = applied_osd_key(cluster, node, id);
    kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_PATH]), &osd.path).await?;
    kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_DATA_DISK_UUID]), &osd.data_disk_uuid).await?;
    kvs::set_if_changed(kvs, &keys::join([base.as_str(), KEY_METADATA_DISK_UUID]), &osd.metadata_disk_uuid).await?;
    Ok(())
}

/// Check if the given desired subtree, relative to a node, asks for any OSD at all.
fn wants_osds(tree: &BTreeMap<String, String>) -> bool {
    tree.keys().any(|key| key != KEY_READY)
}

/// The ids of the OSDs a node's desired state names.
fn desired_ids(dirs: &BTreeMap<String, Option<u32>>, devices: &BTreeMap<String, DeviceMapping>) -> BTreeSet<u32> {
    dirs.values().flatten().chain(devices.values().filter_map(|dev| dev.data.as_ref())).copied().collect()
}
