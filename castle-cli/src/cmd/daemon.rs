//! Run a single storage daemon in place of this process.
//!
//! The node daemon's supervisor launches storage daemons through this command when a driver
//! path is configured, so that every supervised process shows up as the castle binary.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::str::FromStr;

use anyhow::{Context, Result};
use structopt::StructOpt;

use castle_core::AppError;

/// The storage daemons this command knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonType {
    Mon,
    Osd,
    Mds,
    Rgw,
}

impl DaemonType {
    /// The binary implementing this daemon.
    pub fn binary(&self) -> &'static str {
        match self {
            DaemonType::Mon => "ceph-mon",
            DaemonType::Osd => "ceph-osd",
            DaemonType::Mds => "ceph-mds",
            DaemonType::Rgw => "radosgw",
        }
    }
}

impl FromStr for DaemonType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mon" => Ok(DaemonType::Mon),
            "osd" => Ok(DaemonType::Osd),
            "mds" => Ok(DaemonType::Mds),
            "rgw" => Ok(DaemonType::Rgw),
            _ => Err(AppError::ConfigInvalid(format!("unknown daemon type {:?}, expected one of mon, osd, mds, rgw", s))),
        }
    }
}

/// Run a single storage daemon in place of this process.
#[derive(StructOpt)]
#[structopt(name = "daemon")]
pub struct Daemon {
    /// The daemon to run: mon, osd, mds or rgw.
    #[structopt(long = "type")]
    daemon_type: DaemonType,
    /// Arguments handed to the daemon as is.
    #[structopt(last = true)]
    args: Vec<String>,
}

impl Daemon {
    pub fn run(&self) -> Result<()> {
        let binary = self.daemon_type.binary();
        tracing::debug!(binary, args = ?self.args, "replacing process with storage daemon");
        // Only returns on failure.
        let err = Command::new(binary).args(&self.args).exec();
        Err(err).with_context(|| format!("error running {}", binary))
    }
}
