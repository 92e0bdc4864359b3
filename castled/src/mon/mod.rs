//! The monitor service.

mod agent;
mod leader;
#[cfg(test)]
mod leader_test;

use std::path::{Path, PathBuf};

pub use agent::MonAgent;
pub use leader::{monitor_count, MonLeader};

/// The binary of the monitor daemon.
pub const MON_BINARY: &str = "ceph-mon";

/// `<config_root>/<mon>`, the run dir of a monitor.
pub fn run_dir(config_root: &str, mon: &str) -> PathBuf {
    Path::new(config_root).join(mon)
}

pub fn keyring_path(config_root: &str, mon: &str) -> PathBuf {
    run_dir(config_root, mon).join("keyring")
}

/// `<config_root>/<mon>/mon.<mon>`, the data dir of a monitor.
pub fn data_dir(config_root: &str, mon: &str) -> PathBuf {
    run_dir(config_root, mon).join(format!("mon.{}", mon))
}
