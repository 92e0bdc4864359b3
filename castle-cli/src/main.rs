//! The castle driver CLI.

mod client;
mod cmd;
mod error;

use std::io::Write;

use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::client::AdminClient;

/// The castle driver CLI.
#[derive(StructOpt)]
#[structopt(name = "castle")]
pub struct Castle {
    #[structopt(subcommand)]
    action: CastleSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    /// Set the URL of the admin API of a castle node.
    #[structopt(long, default_value = "http://127.0.0.1:8124")]
    url: String,
}

impl Castle {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config.
        let (filter_layer, level_filter) = if self.verbose {
            (EnvFilter::new("debug"), LevelFilter::DEBUG)
        } else {
            (EnvFilter::new("info"), LevelFilter::INFO)
        };
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(level_filter)
            .init();

        match &self.action {
            CastleSubcommands::Daemon(inner) => inner.run(),
            CastleSubcommands::Filesystem(inner) => inner.run(&self).await,
            CastleSubcommands::Object(inner) => inner.run(&self).await,
            CastleSubcommands::Refresh(inner) => inner.run(&self).await,
            CastleSubcommands::Version(inner) => inner.run(),
        }
    }

    /// Get a client of the admin API based on runtime config.
    pub fn get_client(&self) -> Result<AdminClient> {
        AdminClient::new(&self.url)
    }
}

#[derive(StructOpt)]
pub enum CastleSubcommands {
    /// Run a single storage daemon in place of this process.
    #[structopt(name = "daemon")]
    Daemon(cmd::daemon::Daemon),
    /// Shared file system administration.
    #[structopt(name = "filesystem")]
    Filesystem(cmd::filesystem::Filesystem),
    /// Object store administration.
    #[structopt(name = "object")]
    Object(cmd::object::Object),
    /// Ask the cluster leader for a reconcile pass.
    #[structopt(name = "refresh")]
    Refresh(cmd::refresh::Refresh),
    /// Print the version of this CLI.
    #[structopt(name = "version")]
    Version(cmd::version::Version),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match Castle::from_args().run().await {
        Ok(()) => error::EXIT_OK,
        Err(err) => {
            tracing::error!(error = ?err);
            error::exit_code(&err)
        }
    };

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code);
}
