//! The object store and the gateways serving it.
//!
//! The object store is a single cluster-wide switch. While it is enabled every healthy node runs
//! a gateway, all of them sharing one keyring which the leader stores next to the switch.

mod agent;
mod leader;
#[cfg(test)]
mod rgw_test;

use anyhow::Result;

use castle_core::keys;
use castle_core::kvs::{self, Kvs};

pub use agent::RgwAgent;
pub use leader::RgwLeader;

/// The service name of the gateways.
pub const RGW_SERVICE: &str = "rgw";
/// The key segment of the object store switch.
pub const OBJECT_SERVICE: &str = "object";
pub const RGW_BINARY: &str = "radosgw";
/// The port every gateway serves on.
pub const RGW_PORT: u16 = 53390;

const KEY_STATE: &str = "state";
const KEY_KEYRING: &str = "keyring";

fn object_key(cluster: &str, applied: bool, leaf: &str) -> String {
    let base = if applied {
        keys::applied_key(cluster, OBJECT_SERVICE)
    } else {
        keys::desired_key(cluster, OBJECT_SERVICE)
    };
    keys::join([base.as_str(), leaf])
}

fn gateway_key(cluster: &str, node: &str, applied: bool) -> String {
    let base = if applied {
        keys::applied_node_key(cluster, RGW_SERVICE, node)
    } else {
        keys::desired_node_key(cluster, RGW_SERVICE, node)
    };
    keys::join([base.as_str(), KEY_STATE])
}

/// Request the object store.
pub async fn enable_object_store(kvs: &dyn Kvs, cluster: &str) -> Result<()> {
    tracing::info!("enabling object store");
    kvs::set_if_changed(kvs, &object_key(cluster, false, KEY_STATE), keys::MARKER_SET).await?;
    Ok(())
}

/// Withdraw the request for the object store along with every desired gateway.
pub async fn remove_object_store(kvs: &dyn Kvs, cluster: &str) -> Result<()> {
    tracing::info!("removing object store");
    kvs.delete(&keys::desired_key(cluster, OBJECT_SERVICE), true).await?;
    kvs.delete(&keys::desired_key(cluster, RGW_SERVICE), true).await
}

/// Check if the object store is requested, or applied.
pub async fn object_store_enabled(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<bool> {
    Ok(kvs.get(&object_key(cluster, applied, KEY_STATE)).await?.as_deref() == Some(keys::MARKER_SET))
}

/// The gateway keyring stored with the object store request.
pub async fn load_keyring(kvs: &dyn Kvs, cluster: &str) -> Result<Option<String>> {
    kvs.get(&object_key(cluster, false, KEY_KEYRING)).await
}

async fn store_keyring(kvs: &dyn Kvs, cluster: &str, keyring: &str) -> Result<()> {
    kvs::set_if_changed(kvs, &object_key(cluster, false, KEY_KEYRING), keyring).await?;
    Ok(())
}

async fn mark_applied(kvs: &dyn Kvs, cluster: &str) -> Result<()> {
    kvs::set_if_changed(kvs, &object_key(cluster, true, KEY_STATE), keys::MARKER_SET).await?;
    Ok(())
}

async fn mark_unapplied(kvs: &dyn Kvs, cluster: &str) -> Result<()> {
    kvs.delete(&keys::applied_key(cluster, OBJECT_SERVICE), true).await
}

/// The nodes with a desired or applied gateway.
pub async fn load_gateways(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<Vec<String>> {
    let base = if applied {
        keys::applied_key(cluster, RGW_SERVICE)
    } else {
        keys::desired_key(cluster, RGW_SERVICE)
    };
    let tree = kvs.get_tree(&base).await?;
    Ok(kvs
        .list_children(&base)
        .await?
        .into_iter()
        .filter(|node| tree.contains_key(&format!("{}/{}", node, KEY_STATE)))
        .collect())
}

async fn set_gateway(kvs: &dyn Kvs, cluster: &str, node: &str, applied: bool) -> Result<bool> {
    kvs::set_if_changed(kvs, &gateway_key(cluster, node, applied), keys::MARKER_SET).await
}

async fn remove_gateways(kvs: &dyn Kvs, cluster: &str, applied: bool) -> Result<()> {
    let base = if applied {
        keys::applied_key(cluster, RGW_SERVICE)
    } else {
        keys::desired_key(cluster, RGW_SERVICE)
    };
    kvs.delete(&base, true).await
}
