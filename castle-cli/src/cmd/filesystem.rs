//! Shared file system administration.

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::Castle;

/// Shared file system administration.
#[derive(StructOpt)]
#[structopt(name = "filesystem")]
pub struct Filesystem {
    #[structopt(subcommand)]
    action: FilesystemSubcommands,
}

impl Filesystem {
    pub async fn run(&self, base: &Castle) -> Result<()> {
        match &self.action {
            FilesystemSubcommands::Create(inner) => inner.run(base).await,
            FilesystemSubcommands::Delete(inner) => inner.run(base).await,
        }
    }
}

#[derive(StructOpt)]
enum FilesystemSubcommands {
    /// Request a new shared file system.
    Create(Create),
    /// Remove a shared file system together with its metadata servers.
    Delete(Delete),
}

/// Request a new shared file system.
#[derive(StructOpt)]
#[structopt(name = "create")]
pub struct Create {
    /// The name of the file system.
    #[structopt(long)]
    name: String,
    /// The pool backing the file system.
    #[structopt(long)]
    pool: String,
}

impl Create {
    pub async fn run(&self, base: &Castle) -> Result<()> {
        tracing::info!(name = %self.name, pool = %self.pool, "creating file system");
        base.get_client()?
            .create_filesystem(&self.name, &self.pool)
            .await
            .with_context(|| format!("error creating file system {}", self.name))?;
        tracing::info!("file system requested, the cluster leader will apply it");
        Ok(())
    }
}

/// Remove a shared file system.
#[derive(StructOpt)]
#[structopt(name = "delete")]
pub struct Delete {
    /// The name of the file system.
    #[structopt(long)]
    name: String,
}

impl Delete {
    pub async fn run(&self, base: &Castle) -> Result<()> {
        tracing::info!(name = %self.name, "deleting file system");
        base.get_client()?
            .delete_filesystem(&self.name)
            .await
            .with_context(|| format!("error deleting file system {}", self.name))
    }
}
