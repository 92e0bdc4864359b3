//! The node inventory.
//!
//! Each node publishes its own record under `/inventory/nodes/<node>`; everything else reads it.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::prelude::*;

use crate::keys;
use crate::kvs::Kvs;

const KEY_PUBLIC_IP: &str = "publicIp";
const KEY_PRIVATE_IP: &str = "privateIp";
const KEY_HEARTBEAT: &str = "heartbeat";
const KEY_LOCATION: &str = "location";
const KEY_DISKS: &str = "disks";
const KEY_DISK_UUID: &str = "uuid";
const KEY_DISK_SIZE: &str = "size";
const KEY_DISK_TYPE: &str = "type";
const KEY_DISK_PARENT: &str = "parent";

/// The block device type of whole disks.
pub const DISK_TYPE_DISK: &str = "disk";
/// The block device type of partitions.
pub const DISK_TYPE_PART: &str = "part";

/// A block device discovered on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Disk {
    /// The kernel name of the device, e.g. `sda`.
    pub name: String,
    /// The size of the device in bytes.
    pub size: u64,
    /// The partition table GUID of the device, empty if it has none.
    pub uuid: String,
    /// The device type as reported by the kernel, `disk` or `part` for the ones we care about.
    #[serde(rename = "type")]
    pub disk_type: String,
    /// The parent device of a partition.
    #[serde(default)]
    pub parent: String,
}

/// The configuration and health of a single node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeConfig {
    pub node_id: String,
    pub public_ip: String,
    pub private_ip: String,
    /// The last time the node checked in.
    pub heartbeat: Option<DateTime<Utc>>,
    /// The CRUSH location of the node, if one has been set.
    pub location: String,
    pub disks: Vec<Disk>,
}

impl NodeConfig {
    /// The age of the node's last heartbeat, `None` if it never checked in.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.heartbeat.map(|hb| (now - hb).to_std().unwrap_or_default())
    }

    /// Check if the node checked in more recently than `threshold`.
    pub fn is_healthy(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        matches!(self.heartbeat_age(now), Some(age) if age < threshold)
    }

    /// Look up a whole disk by its partition table GUID.
    pub fn disk_by_uuid(&self, uuid: &str) -> Option<&Disk> {
        self.disks.iter().find(|disk| !uuid.is_empty() && disk.uuid == uuid && disk.disk_type == DISK_TYPE_DISK)
    }

    /// Look up a disk by name.
    pub fn disk_by_name(&self, name: &str) -> Option<&Disk> {
        self.disks.iter().find(|disk| disk.name == name)
    }
}

/// A point in time view of all nodes, in stable node-id order.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    pub nodes: BTreeMap<String, NodeConfig>,
}

impl Inventory {
    /// Load every node record from the store.
    pub async fn load(kvs: &dyn Kvs) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for node_id in kvs.list_children(keys::INVENTORY_NODES).await? {
            let node = load_node(kvs, &node_id).await.with_context(|| format!("error loading inventory of node {}", node_id))?;
            nodes.insert(node_id, node);
        }
        Ok(Self { nodes })
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Ids of the nodes which checked in more recently than `threshold`.
    pub fn healthy_nodes(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.is_healthy(now, threshold))
            .map(|node| node.node_id.clone())
            .collect()
    }
}

/// Load a single node record from the store.
pub async fn load_node(kvs: &dyn Kvs, node_id: &str) -> Result<NodeConfig> {
    let tree = kvs.get_tree(&keys::node_key(node_id)).await?;
    let field = |name: &str| tree.get(name).cloned().unwrap_or_default();

    // A heartbeat which does not parse is treated as if the node never checked in.
    let heartbeat = tree
        .get(KEY_HEARTBEAT)
        .and_then(|val| DateTime::parse_from_rfc3339(val).ok())
        .map(|ts| ts.with_timezone(&Utc));

    let mut disks: BTreeMap<String, Disk> = BTreeMap::new();
    for (path, val) in tree.iter() {
        let mut segments = path.split('/');
        if segments.next() != Some(KEY_DISKS) {
            continue;
        }
        let (name, attr) = match (segments.next(), segments.next()) {
            (Some(name), Some(attr)) => (name, attr),
            _ => continue,
        };
        let disk = disks.entry(name.to_string()).or_insert_with(|| Disk {
            name: name.to_string(),
            ..Default::default()
        });
        match attr {
            KEY_DISK_UUID => disk.uuid = val.clone(),
            KEY_DISK_SIZE => disk.size = val.parse().unwrap_or_default(),
            KEY_DISK_TYPE => disk.disk_type = val.clone(),
            KEY_DISK_PARENT => disk.parent = val.clone(),
            _ => (),
        }
    }

    Ok(NodeConfig {
        node_id: node_id.to_string(),
        public_ip: field(KEY_PUBLIC_IP),
        private_ip: field(KEY_PRIVATE_IP),
        heartbeat,
        location: field(KEY_LOCATION),
        disks: disks.into_values().collect(),
    })
}

/// Write the given node record, replacing the node's disk listing.
pub async fn store_node(kvs: &dyn Kvs, node: &NodeConfig) -> Result<()> {
    let base = keys::node_key(&node.node_id);
    kvs.set(&keys::join([base.as_str(), KEY_PUBLIC_IP]), &node.public_ip).await?;
    kvs.set(&keys::join([base.as_str(), KEY_PRIVATE_IP]), &node.private_ip).await?;
    if !node.location.is_empty() {
        kvs.set(&keys::join([base.as_str(), KEY_LOCATION]), &node.location).await?;
    }
    store_disks(kvs, &node.node_id, &node.disks).await?;
    if let Some(hb) = node.heartbeat {
        set_heartbeat(kvs, &node.node_id, hb).await?;
    }
    Ok(())
}

/// Replace the disk listing of the given node.
pub async fn store_disks(kvs: &dyn Kvs, node_id: &str, disks: &[Disk]) -> Result<()> {
    let disks_key = keys::join([keys::node_key(node_id).as_str(), KEY_DISKS]);
    let existing = kvs.list_children(&disks_key).await?;
    for stale in existing.iter().filter(|name| !disks.iter().any(|d| &d.name == *name)) {
        kvs.delete(&keys::join([disks_key.as_str(), stale]), true).await?;
    }
    for disk in disks {
        let disk_key = keys::join([disks_key.as_str(), disk.name.as_str()]);
        crate::kvs::set_if_changed(kvs, &keys::join([disk_key.as_str(), KEY_DISK_UUID]), &disk.uuid).await?;
        crate::kvs::set_if_changed(kvs, &keys::join([disk_key.as_str(), KEY_DISK_SIZE]), &disk.size.to_string()).await?;
        crate::kvs::set_if_changed(kvs, &keys::join([disk_key.as_str(), KEY_DISK_TYPE]), &disk.disk_type).await?;
        crate::kvs::set_if_changed(kvs, &keys::join([disk_key.as_str(), KEY_DISK_PARENT]), &disk.parent).await?;
    }
    Ok(())
}

/// Record a heartbeat for the given node.
pub async fn set_heartbeat(kvs: &dyn Kvs, node_id: &str, ts: DateTime<Utc>) -> Result<()> {
    let key = keys::join([keys::node_key(node_id).as_str(), KEY_HEARTBEAT]);
    kvs.set(&key, &ts.to_rfc3339()).await
}

/// Record the CRUSH location of the given node.
pub async fn set_location(kvs: &dyn Kvs, node_id: &str, location: &str) -> Result<()> {
    let key = keys::join([keys::node_key(node_id).as_str(), KEY_LOCATION]);
    crate::kvs::set_if_changed(kvs, &key, location).await.map(|_| ())
}

/// Update the partition table GUID recorded for one of the given node's disks.
pub async fn set_disk_uuid(kvs: &dyn Kvs, node_id: &str, disk_name: &str, uuid: &str) -> Result<()> {
    let key = keys::join([keys::node_key(node_id).as_str(), KEY_DISKS, disk_name, KEY_DISK_UUID]);
    crate::kvs::set_if_changed(kvs, &key, uuid).await.map(|_| ())
}
