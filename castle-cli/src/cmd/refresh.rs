//! Ask the cluster leader for a reconcile pass.

use anyhow::{Context, Result};
use structopt::StructOpt;

use crate::Castle;

/// Ask the cluster leader for a reconcile pass.
#[derive(StructOpt)]
#[structopt(name = "refresh")]
pub struct Refresh {}

impl Refresh {
    pub async fn run(&self, base: &Castle) -> Result<()> {
        base.get_client()?.refresh().await.context("error requesting refresh")?;
        tracing::info!("refresh requested");
        Ok(())
    }
}
