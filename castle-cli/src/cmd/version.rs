use anyhow::Result;
use structopt::StructOpt;

/// Print the version of this CLI.
#[derive(StructOpt)]
#[structopt(name = "version")]
pub struct Version {}

impl Version {
    pub fn run(&self) -> Result<()> {
        println!("castle {}", env!("CARGO_PKG_VERSION"));
        Ok(())
    }
}
