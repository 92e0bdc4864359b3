//! A store backed by an etcd cluster, shared by every node of a deployment.
//!
//! A single prefix watch over the whole keyspace is opened when connecting and fans out into a
//! local event bus, so `watch` can subscribe synchronously like the local backends do. When the
//! etcd watch breaks it is re-established from the revision after the last one seen.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use etcd_client::{Client, DeleteOptions, Event, EventType, GetOptions, WatchOptions, Watcher};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{child_names, relative, watch_bus, Kvs, WatchAction, WatchEvent, WatchStream, WATCH_BUS_CAPACITY};
use crate::keys;

/// The prefix covering every control-plane key.
const KEYSPACE_ROOT: &str = "/";
/// The delay between attempts to re-establish a broken watch.
const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// A KVS stored in etcd.
#[derive(Clone)]
pub struct EtcdKvs {
    inner: Arc<EtcdKvsInner>,
}

struct EtcdKvsInner {
    client: Client,
    events: broadcast::Sender<WatchEvent>,
    forwarder: JoinHandle<()>,
}

impl Drop for EtcdKvsInner {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl EtcdKvs {
    /// Connect to the given etcd endpoints and start watching the keyspace.
    pub async fn connect<E: AsRef<str>>(endpoints: &[E]) -> Result<Self> {
        let endpoints: Vec<&str> = endpoints.iter().map(AsRef::as_ref).collect();
        tracing::info!(endpoints = ?endpoints, "connecting to etcd");
        let mut client = Client::connect(&endpoints, None)
            .await
            .with_context(|| format!("error connecting to etcd at {:?}", endpoints))?;
        let (watcher, stream) = client
            .watch(KEYSPACE_ROOT, Some(WatchOptions::new().with_prefix()))
            .await
            .context("error watching etcd keyspace")?;

        let (events, _) = broadcast::channel(WATCH_BUS_CAPACITY);
        let forwarder = tokio::spawn(forward_events(client.clone(), watcher, stream, events.clone()));
        Ok(Self {
            inner: Arc::new(EtcdKvsInner { client, events, forwarder }),
        })
    }

    fn client(&self) -> Client {
        self.inner.client.clone()
    }

    /// Every key beneath `dir`, exclusive of `dir` itself.
    async fn scan_beneath(&self, dir: &str) -> Result<Vec<(String, String)>> {
        let resp = self
            .client()
            .get(dir_prefix(dir), Some(GetOptions::new().with_prefix()))
            .await
            .with_context(|| format!("error reading keys beneath {}", dir))?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().context("non utf-8 key in etcd")?;
            let val = kv.value_str().with_context(|| format!("non utf-8 value at {}", key))?;
            out.push((key.to_string(), val.to_string()));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Kvs for EtcdKvs {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = keys::join([key]);
        let resp = self
            .client()
            .get(key.as_str(), None)
            .await
            .with_context(|| format!("error reading {}", key))?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str().with_context(|| format!("non utf-8 value at {}", key))?.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = keys::join([key]);
        self.client()
            .put(key.as_str(), value, None)
            .await
            .with_context(|| format!("error writing {}", key))?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let key = keys::join([key]);
        let mut client = self.client();
        client
            .delete(key.as_str(), None)
            .await
            .with_context(|| format!("error deleting {}", key))?;
        if recursive {
            client
                .delete(dir_prefix(&key), Some(DeleteOptions::new().with_prefix()))
                .await
                .with_context(|| format!("error deleting keys beneath {}", key))?;
        }
        Ok(())
    }

    async fn list_children(&self, dir: &str) -> Result<BTreeSet<String>> {
        let dir = keys::join([dir]);
        let found = self.scan_beneath(&dir).await?;
        Ok(child_names(&dir, found.iter().map(|(key, _)| key.as_str())))
    }

    async fn get_tree(&self, dir: &str) -> Result<BTreeMap<String, String>> {
        let dir = keys::join([dir]);
        let found = self.scan_beneath(&dir).await?;
        Ok(found
            .into_iter()
            .map(|(key, val)| (relative(&dir, &key).to_string(), val))
            .collect())
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        watch_bus(&self.inner.events, &keys::join([prefix]))
    }
}

/// The etcd prefix of every key beneath `dir`.
fn dir_prefix(dir: &str) -> String {
    format!("{}/", dir.trim_end_matches('/'))
}

/// The kind of change of an etcd event. A put of a key's first version is a creation.
fn watch_action(event_type: EventType, version: i64) -> WatchAction {
    match event_type {
        EventType::Delete => WatchAction::Delete,
        EventType::Put if version == 1 => WatchAction::Create,
        EventType::Put => WatchAction::Update,
    }
}

fn to_watch_event(event: &Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let key = match kv.key_str() {
        Ok(key) => key.to_string(),
        Err(err) => {
            tracing::warn!(error = ?err, "skipping etcd event with a non utf-8 key");
            return None;
        }
    };
    let action = watch_action(event.event_type(), kv.version());
    let value = match action {
        WatchAction::Delete => None,
        _ => Some(kv.value_str().map(String::from).unwrap_or_default()),
    };
    Some(WatchEvent { key, action, value })
}

/// Forward the events of the keyspace watch onto the local bus until the store is dropped.
/// The watch lives as long as its watcher is held.
async fn forward_events(mut client: Client, mut _watcher: Watcher, mut stream: etcd_client::WatchStream, events: broadcast::Sender<WatchEvent>) {
    let mut next_revision = 0;
    loop {
        match stream.message().await {
            Ok(Some(resp)) => {
                for event in resp.events() {
                    if let Some(kv) = event.kv() {
                        next_revision = next_revision.max(kv.mod_revision() + 1);
                    }
                    if let Some(event) = to_watch_event(event) {
                        let _ = events.send(event);
                    }
                }
                if !resp.canceled() {
                    continue;
                }
                tracing::warn!(reason = %resp.cancel_reason(), "etcd watch was canceled");
            }
            Ok(None) => tracing::warn!("etcd watch stream closed"),
            Err(err) => tracing::warn!(error = ?err, "error from etcd watch stream"),
        }

        loop {
            tokio::time::sleep(REWATCH_DELAY).await;
            let mut opts = WatchOptions::new().with_prefix();
            if next_revision > 0 {
                opts = opts.with_start_revision(next_revision);
            }
            match client.watch(KEYSPACE_ROOT, Some(opts)).await {
                Ok((new_watcher, new_stream)) => {
                    tracing::info!(revision = next_revision, "re-established etcd watch");
                    _watcher = new_watcher;
                    stream = new_stream;
                    break;
                }
                Err(err) => tracing::error!(error = ?err, "error re-establishing etcd watch"),
            }
        }
    }
}

#[cfg(test)]
#[path = "etcd_test.rs"]
mod etcd_test;
