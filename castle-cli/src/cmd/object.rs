//! Object store administration.

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::Castle;

/// Object store administration.
#[derive(StructOpt)]
#[structopt(name = "object")]
pub struct Object {
    #[structopt(subcommand)]
    action: ObjectSubcommands,
}

#[derive(StructOpt)]
enum ObjectSubcommands {
    /// Enable the object store, running a gateway on every healthy node.
    Create,
    /// Disable the object store and stop its gateways.
    Delete,
}

impl Object {
    pub async fn run(&self, base: &Castle) -> Result<()> {
        let client = base.get_client()?;
        match &self.action {
            ObjectSubcommands::Create => {
                tracing::info!("enabling object store");
                client.create_object_store().await.context("error enabling object store")
            }
            ObjectSubcommands::Delete => {
                tracing::info!("removing object store");
                client.delete_object_store().await.context("error removing object store")
            }
        }
    }
}
