//! An in-memory store, used by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};

use super::{child_names, relative, watch_bus, Kvs, WatchAction, WatchEvent, WatchStream, WATCH_BUS_CAPACITY};
use crate::keys;

/// An in-memory KVS backed by an ordered map.
#[derive(Clone)]
pub struct MemKvs {
    inner: Arc<MemKvsInner>,
}

struct MemKvsInner {
    data: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
    /// The number of mutations applied to the store.
    writes: AtomicU64,
}

impl MemKvs {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUS_CAPACITY);
        Self {
            inner: Arc::new(MemKvsInner {
                data: RwLock::new(BTreeMap::new()),
                events,
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// The number of mutations applied to this store so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// A copy of every key currently in the store.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.data.read().await.clone()
    }

    fn publish(&self, key: String, action: WatchAction, value: Option<String>) {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is not an error for us.
        let _ = self.inner.events.send(WatchEvent { key, action, value });
    }
}

impl Default for MemKvs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Kvs for MemKvs {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = keys::join([key]);
        Ok(self.inner.data.read().await.get(&key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = keys::join([key]);
        let mut data = self.inner.data.write().await;
        let action = match data.insert(key.clone(), value.to_string()) {
            Some(_) => WatchAction::Update,
            None => WatchAction::Create,
        };
        self.publish(key, action, Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = keys::join([key]);
        let mut data = self.inner.data.write().await;
        let doomed: Vec<String> = if recursive {
            data.range(key.clone()..)
                .map(|(k, _)| k)
                .take_while(|k| k.starts_with(key.as_str()))
                .filter(|k| keys::is_within(k, &key))
                .cloned()
                .collect()
        } else {
            data.contains_key(&key).then(|| key.clone()).into_iter().collect()
        };
        for doomed_key in doomed {
            data.remove(&doomed_key);
            self.publish(doomed_key, WatchAction::Delete, None);
        }
        Ok(())
    }

    async fn list_children(&self, dir: &str) -> Result<BTreeSet<String>> {
        let dir = keys::join([dir]);
        let data = self.inner.data.read().await;
        let names = child_names(&dir, data.range(dir.clone()..).map(|(k, _)| k.as_str()).take_while(|k| k.starts_with(dir.as_str())));
        Ok(names)
    }

    async fn get_tree(&self, dir: &str) -> Result<BTreeMap<String, String>> {
        let dir = keys::join([dir]);
        let data = self.inner.data.read().await;
        let tree = data
            .range(dir.clone()..)
            .take_while(|(k, _)| k.starts_with(dir.as_str()))
            .filter(|(k, _)| keys::is_within(k, &dir) && k.len() > dir.len())
            .map(|(k, v)| (relative(&dir, k).to_string(), v.clone()))
            .collect();
        Ok(tree)
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        watch_bus(&self.inner.events, &keys::join([prefix]))
    }
}
