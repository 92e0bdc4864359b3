//! The services bundle and the per-pass context handed to leaders and agents.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::prelude::*;
use tokio::sync::broadcast;

use crate::ceph::CephClient;
use crate::config::Config;
use crate::database::Database;
use crate::exec::{DynExecutor, Executor};
use crate::proc::{DynSupervisor, Supervisor};
use castle_core::inventory::{Inventory, NodeConfig};
use castle_core::kvs::{DynKvs, Kvs};

/// Long-lived handles shared by every component of the daemon.
pub struct Services {
    pub config: Arc<Config>,
    pub kvs: DynKvs,
    pub executor: DynExecutor,
    pub supervisor: DynSupervisor,
    pub db: Database,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Services {
    /// A client of the cluster using this node's admin connection config.
    pub fn ceph(&self) -> CephClient {
        CephClient::admin(&self.config, self.executor.clone())
    }
}

/// An immutable view of the world for a single leader or agent pass.
#[derive(Clone)]
pub struct Context {
    pub services: Arc<Services>,
    /// The inventory as of the start of the pass.
    pub inventory: Arc<Inventory>,
    /// The time the pass started, used for all health decisions within it.
    pub now: DateTime<Utc>,
}

impl Context {
    /// Build a context from the current inventory.
    pub async fn load(services: &Arc<Services>) -> Result<Self> {
        let inventory = Inventory::load(services.kvs.as_ref()).await.context("error loading inventory")?;
        Ok(Self {
            services: services.clone(),
            inventory: Arc::new(inventory),
            now: Utc::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    pub fn kvs(&self) -> &dyn Kvs {
        self.services.kvs.as_ref()
    }

    pub fn executor(&self) -> &dyn Executor {
        self.services.executor.as_ref()
    }

    pub fn supervisor(&self) -> &dyn Supervisor {
        self.services.supervisor.as_ref()
    }

    pub fn node_id(&self) -> &str {
        &self.services.config.node_id
    }

    pub fn cluster(&self) -> &str {
        &self.services.config.cluster_name
    }

    /// This node's own inventory record.
    pub fn local_node(&self) -> Option<&NodeConfig> {
        self.inventory.get(self.node_id())
    }

    /// Check if the given node is in the inventory with a fresh heartbeat.
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.inventory
            .get(node_id)
            .map(|node| node.is_healthy(self.now, self.config().unhealthy_threshold()))
            .unwrap_or(false)
    }

    pub fn ceph(&self) -> CephClient {
        self.services.ceph()
    }
}
