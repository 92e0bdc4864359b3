//! The node-local durable store.
//!
//! Each node keeps one sled database under `data_path/<node-id>`. It holds the persisted
//! partition scheme of the node and, for single node deployments, the control-plane keys.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sled::{Config as SledConfig, Db};

use crate::config::Config;
use castle_core::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The prefix of the tree holding a node's partition scheme.
const SCHEME_TREE_PREFIX: &str = "scheme";

/// A handle to the node-local database.
#[derive(Clone)]
pub struct Database {
    node_id: Arc<str>,
    db: Db,
}

impl Database {
    /// Open the database of the configured node, creating its directory as needed.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let path = PathBuf::from(&config.data_path).join(&config.node_id);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("error creating database dir {}", path.display()))?;

        let db = Self::spawn_blocking(move || SledConfig::new().path(path).mode(sled::Mode::HighThroughput).open())
            .await?
            .context("error opening node database")?;
        Ok(Self {
            node_id: Arc::from(config.node_id.as_str()),
            db,
        })
    }

    /// Run blocking database work off the async runtime. A failed join is fatal.
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError(anyhow::Error::from(err).context("database task panicked or was cancelled")))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Open the tree holding this node's partition scheme.
    pub async fn scheme_tree(&self) -> ShutdownResult<Tree> {
        let name = format!("{}/{}", SCHEME_TREE_PREFIX, self.node_id);
        let db = self.db.clone();
        Self::spawn_blocking(move || db.open_tree(name.as_bytes()).with_context(|| format!("error opening tree {}", name)))
            .await?
            .map_err(ShutdownError)
    }
}
