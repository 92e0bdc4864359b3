//! The inventory publisher.
//!
//! Every node keeps its own inventory record fresh: its addresses and CRUSH location once at
//! startup, its disks whenever discovery finds them changed, and a heartbeat on every tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::prelude::*;
use futures::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::context::Services;
use crate::sys;
use castle_core::inventory::{self, Disk, NodeConfig};

/// A task publishing this node's inventory record.
pub struct Heartbeat {
    services: Arc<Services>,
    /// The disks as last published.
    disks: Option<Vec<Disk>>,
    shutdown: BroadcastStream<()>,
}

impl Heartbeat {
    pub fn new(services: Arc<Services>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            services,
            disks: None,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let config = self.services.config.clone();
        tracing::info!(node = %config.node_id, "heartbeat started");
        let record = NodeConfig {
            node_id: config.node_id.clone(),
            public_ip: config.public_ip.clone(),
            private_ip: config.private_ip.clone(),
            heartbeat: None,
            location: config.location.clone(),
            disks: vec![],
        };
        let mut registered = false;
        let mut ticker = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !registered {
                        match inventory::store_node(self.services.kvs.as_ref(), &record).await {
                            Ok(()) => registered = true,
                            Err(err) => {
                                tracing::error!(error = ?err, "error registering node in inventory");
                                continue;
                            }
                        }
                    }
                    if let Err(err) = self.beat(Utc::now()).await {
                        tracing::error!(error = ?err, "error publishing heartbeat");
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("heartbeat shutdown");
        Ok(())
    }

    /// Publish the disks if they changed since the last beat, then the heartbeat itself.
    pub async fn beat(&mut self, now: DateTime<Utc>) -> Result<()> {
        let (kvs, node_id) = (self.services.kvs.as_ref(), &self.services.config.node_id);
        match sys::discover_devices(self.services.executor.as_ref()).await {
            Ok(disks) if self.disks.as_ref() != Some(&disks) => {
                tracing::debug!(count = disks.len(), "publishing discovered disks");
                inventory::store_disks(kvs, node_id, &disks).await?;
                self.disks = Some(disks);
            }
            Ok(_) => (),
            // A node which cannot list its disks is still alive.
            Err(err) => tracing::warn!(error = ?err, "error discovering devices"),
        }
        inventory::set_heartbeat(kvs, node_id, now).await
    }
}

#[cfg(test)]
#[path = "heartbeat_test.rs"]
mod heartbeat_test;
