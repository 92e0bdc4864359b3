//! The key/value store abstraction backing all control-plane state.
//!
//! The store is an ordered tree of string keys with implicit directories. Missing keys are not
//! errors: `get` yields `None`, and deleting a missing key succeeds. Watches are delivered over
//! a broadcast bus, so a slow watcher may miss intermediate values during a burst of writes, but
//! every watcher sees writes in the order they were applied.

mod etcd;
mod mem;
#[cfg(test)]
mod mod_test;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::keys;

pub use etcd::EtcdKvs;
pub use mem::MemKvs;
pub use store::SledKvs;

/// A shared handle to a KVS implementation.
pub type DynKvs = Arc<dyn Kvs>;

/// A stream of watch events.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// The capacity of the watch event bus of each store.
const WATCH_BUS_CAPACITY: usize = 4096;

/// The kind of change a watch event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Update,
    Delete,
}

/// A change observed on a watched key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// The full key which changed.
    pub key: String,
    /// The kind of change.
    pub action: WatchAction,
    /// The new value of the key, absent for deletes.
    pub value: Option<String>,
}

/// The contract every control-plane store implements.
#[async_trait::async_trait]
pub trait Kvs: Send + Sync {
    /// Get the value of the given key, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Create or overwrite the given key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the given key, and when `recursive` everything beneath it as well.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    /// List the names of the immediate children of the given directory.
    async fn list_children(&self, dir: &str) -> Result<BTreeSet<String>>;

    /// Get every key beneath the given directory, keyed by its path relative to `dir`.
    async fn get_tree(&self, dir: &str) -> Result<BTreeMap<String, String>>;

    /// Watch the given key and everything beneath it.
    ///
    /// The subscription is registered before this call returns, so any write issued after it
    /// will be observed on the returned stream.
    fn watch(&self, prefix: &str) -> WatchStream;
}

/// Set the given key only if its current value differs, returning `true` if a write happened.
pub async fn set_if_changed(kvs: &dyn Kvs, key: &str, value: &str) -> Result<bool> {
    if kvs.get(key).await?.as_deref() == Some(value) {
        return Ok(false);
    }
    kvs.set(key, value).await?;
    Ok(true)
}

/// Get the given key, returning `default` if it does not exist.
pub async fn get_or(kvs: &dyn Kvs, key: &str, default: &str) -> Result<String> {
    Ok(kvs.get(key).await?.unwrap_or_else(|| default.to_string()))
}

/// Build a filtered watch stream over the given event bus.
fn watch_bus(events: &broadcast::Sender<WatchEvent>, prefix: &str) -> WatchStream {
    let prefix = prefix.to_string();
    BroadcastStream::new(events.subscribe())
        .filter_map(move |res| {
            let out = match res {
                Ok(event) if keys::is_within(&event.key, &prefix) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    tracing::warn!(count, prefix = %prefix, "watcher lagged behind the store, events were dropped");
                    None
                }
            };
            future::ready(out)
        })
        .boxed()
}

/// Compute the immediate child names of `dir` from an ordered iterator of keys beneath it.
fn child_names<'a>(dir: &str, keys: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    let dir = dir.trim_end_matches('/');
    keys.filter(|key| keys::is_within(key, dir) && key.len() > dir.len())
        .filter_map(|key| key[dir.len()..].trim_start_matches('/').split('/').next())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// The path of `key` relative to `dir`.
fn relative<'a>(dir: &str, key: &'a str) -> &'a str {
    key[dir.trim_end_matches('/').len()..].trim_start_matches('/')
}
