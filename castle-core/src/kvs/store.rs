//! A store persisted with sled, for single node deployments and node-local state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sled::{Config as SledConfig, IVec, Tree};
use tokio::sync::broadcast;

use super::{child_names, relative, watch_bus, Kvs, WatchAction, WatchEvent, WatchStream, WATCH_BUS_CAPACITY};
use crate::error::{ShutdownError, ShutdownResult};
use crate::keys;

/// The name of the sled tree holding control-plane keys.
const TREE_KVS: &str = "kvs";

/// A KVS persisted in a sled tree.
#[derive(Clone)]
pub struct SledKvs {
    inner: Arc<SledKvsInner>,
}

struct SledKvsInner {
    tree: Tree,
    events: broadcast::Sender<WatchEvent>,
}

impl SledKvs {
    /// Open the store at the given path, creating it as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path).await.context("error creating dir for kvs database")?;
        let db = spawn_blocking(move || -> Result<sled::Db> {
            SledConfig::new()
                .path(path)
                .mode(sled::Mode::HighThroughput)
                .open()
                .context("error opening kvs database")
        })
        .await??;
        Self::from_db(&db).await
    }

    /// Build a store over the `kvs` tree of an already open database.
    pub async fn from_db(db: &sled::Db) -> Result<Self> {
        let db = db.clone();
        let tree = spawn_blocking(move || db.open_tree(IVec::from(TREE_KVS)))
            .await?
            .with_context(|| format!("could not open DB tree {}", TREE_KVS))?;
        let (events, _) = broadcast::channel(WATCH_BUS_CAPACITY);
        Ok(Self {
            inner: Arc::new(SledKvsInner { tree, events }),
        })
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.tree.flush_async().await.context("error flushing kvs database")?;
        Ok(())
    }

    fn publish(&self, key: String, action: WatchAction, value: Option<String>) {
        let _ = self.inner.events.send(WatchEvent { key, action, value });
    }

    /// Scan every key beneath `dir`, inclusive of `dir` itself.
    fn scan_within(&self, dir: &str) -> Result<Vec<(String, String)>> {
        let mut out = vec![];
        for kv_res in self.inner.tree.scan_prefix(dir.as_bytes()) {
            let (key, val) = kv_res.context("error returned during key/value iteration from database")?;
            let key = decode_str(&key)?;
            if !keys::is_within(&key, dir) {
                continue;
            }
            out.push((key, decode_str(&val)?));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Kvs for SledKvs {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = keys::join([key]);
        let val = self.inner.tree.get(key.as_bytes()).context("error reading key from database")?;
        // A value which does not decode is treated as absent so that callers re-derive it.
        Ok(val.and_then(|val| decode_str(&val).ok()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = keys::join([key]);
        let old = self
            .inner
            .tree
            .insert(key.as_bytes(), value.as_bytes())
            .context("error writing key to database")?;
        let action = if old.is_some() { WatchAction::Update } else { WatchAction::Create };
        self.publish(key, action, Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = keys::join([key]);
        let doomed = if recursive {
            self.scan_within(&key)?.into_iter().map(|(k, _)| k).collect()
        } else {
            vec![key]
        };
        for doomed_key in doomed {
            let old = self.inner.tree.remove(doomed_key.as_bytes()).context("error deleting key from database")?;
            if old.is_some() {
                self.publish(doomed_key, WatchAction::Delete, None);
            }
        }
        Ok(())
    }

    async fn list_children(&self, dir: &str) -> Result<BTreeSet<String>> {
        let dir = keys::join([dir]);
        let found = self.scan_within(&dir)?;
        Ok(child_names(&dir, found.iter().map(|(k, _)| k.as_str())))
    }

    async fn get_tree(&self, dir: &str) -> Result<BTreeMap<String, String>> {
        let dir = keys::join([dir]);
        let tree = self
            .scan_within(&dir)?
            .into_iter()
            .filter(|(k, _)| k.len() > dir.len())
            .map(|(k, v)| (relative(&dir, &k).to_string(), v))
            .collect();
        Ok(tree)
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        watch_bus(&self.inner.events, &keys::join([prefix]))
    }
}

fn decode_str(val: &IVec) -> Result<String> {
    String::from_utf8(val.to_vec()).context("error decoding utf-8 value from database")
}

/// Spawn a blocking database-related function, returning a ShutdownError if anything goes
/// wrong related to spawning & joining.
#[tracing::instrument(level = "trace", skip(f), err)]
async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
}
