//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::osd::crush;
use crate::osd::scheme::StoreType;
use castle_core::AppError;

/// The default name of the cluster.
pub const DEFAULT_CLUSTER_NAME: &str = "castle";
/// The default root of all on-disk configuration.
pub const DEFAULT_CONFIG_ROOT: &str = "/var/lib/castle";
/// The default path of the node-local database.
pub const DEFAULT_DATA_PATH: &str = "/var/lib/castle/db";

/// The location of the control-plane store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvsBackend {
    /// An etcd cluster shared by every node, by endpoint.
    Etcd(Vec<String>),
    /// The node-local database, for single node deployments.
    NodeLocal,
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The log level handed down to the storage daemons: `warn`, `info`, `debug` or `trace`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// The unique id of this node.
    pub node_id: String,
    /// The name of the cluster this node belongs to.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// The IP address on which this node serves clients.
    pub public_ip: String,
    /// The IP address used for replication traffic between nodes.
    #[serde(default)]
    pub private_ip: String,
    /// The CIDR of the public network.
    #[serde(default)]
    pub public_network: String,
    /// The CIDR of the private network.
    #[serde(default)]
    pub private_network: String,

    /// The root under which all daemon config, keyrings and data dirs are written.
    #[serde(default = "default_config_root")]
    pub config_root: String,
    /// The path to the node-local database on disk.
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// The etcd endpoints of the control-plane store shared by every node, as a comma list.
    /// Without any, the store lives in the node-local database and the node runs alone.
    #[serde(default)]
    pub kvs_endpoints: String,

    /// The port of the admin API.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// The port of the metrics server.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Comma-separated list or regex of the devices which may be claimed for OSDs; `all`
    /// claims every available device.
    #[serde(default)]
    pub devices: String,
    /// Treat `devices` as a regex.
    #[serde(default)]
    pub using_device_filter: bool,
    /// A device reserved for bluestore WAL/DB partitions.
    #[serde(default)]
    pub metadata_device: String,
    /// Comma-separated list of directories to back directory OSDs.
    #[serde(default)]
    pub directories: String,
    /// Overwrite foreign filesystems and partitions on claimed devices.
    #[serde(default)]
    pub force_format: bool,
    /// The OSD store backend.
    #[serde(default)]
    pub store_type: StoreType,
    #[serde(default = "default_wal_size_mb")]
    pub wal_size_mb: u64,
    #[serde(default = "default_db_size_mb")]
    pub db_size_mb: u64,
    #[serde(default = "default_journal_size_mb")]
    pub journal_size_mb: u64,
    /// The CRUSH location of this node, as `k=v` pairs.
    #[serde(default)]
    pub location: String,
    /// An externally supplied admin key; generated when empty.
    #[serde(default)]
    pub admin_secret: String,

    /// The cluster admin binary.
    #[serde(default = "default_ceph_binary")]
    pub ceph_binary: String,
    /// When set, daemons are spawned through `<launcher> daemon --type=<kind> -- <args>`.
    #[serde(default)]
    pub daemon_launcher: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Nodes whose heartbeat is older than this are considered unhealthy.
    #[serde(default = "default_unhealthy_threshold_secs")]
    pub unhealthy_threshold_secs: u64,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_deadline_secs")]
    pub renew_deadline_secs: u64,
    #[serde(default = "default_retry_period_secs")]
    pub retry_period_secs: u64,
    /// The per-target budget of a trigger-and-wait.
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
    /// The wait applied when triggering nodes which are likely gone.
    #[serde(default = "default_removal_timeout_secs")]
    pub removal_timeout_secs: u64,
    #[serde(default = "default_quorum_retries")]
    pub quorum_retries: u32,
    #[serde(default = "default_quorum_interval_secs")]
    pub quorum_interval_secs: u64,
    /// The delay between the two attempts of a format or partition command, in milliseconds.
    #[serde(default = "default_format_retry_delay_ms")]
    pub format_retry_delay_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config, returning `AppError::ConfigInvalid` on the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| anyhow::Error::from(AppError::ConfigInvalid(msg));
        if self.node_id.is_empty() {
            return Err(invalid("NODE_ID must not be empty".into()));
        }
        if self.cluster_name.is_empty() || self.cluster_name.contains('/') {
            return Err(invalid(format!("invalid cluster name {:?}", self.cluster_name)));
        }
        if !["warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            return Err(invalid(format!("unknown log level {:?}", self.log_level)));
        }
        if self.lease_duration_secs <= self.renew_deadline_secs {
            return Err(invalid("LEASE_DURATION_SECS must be greater than RENEW_DEADLINE_SECS".into()));
        }
        if self.renew_deadline_secs <= self.retry_period_secs {
            return Err(invalid("RENEW_DEADLINE_SECS must be greater than RETRY_PERIOD_SECS".into()));
        }
        if self.using_device_filter {
            regex::Regex::new(&self.devices).map_err(|err| invalid(format!("invalid device filter {:?}: {}", self.devices, err)))?;
        }
        if !self.location.is_empty() {
            crush::parse_location(&self.location).map_err(|err| invalid(err.to_string()))?;
        }
        Ok(())
    }

    /// Where the control-plane store lives.
    pub fn kvs_backend(&self) -> KvsBackend {
        let endpoints = split_list(&self.kvs_endpoints);
        if endpoints.is_empty() {
            KvsBackend::NodeLocal
        } else {
            KvsBackend::Etcd(endpoints)
        }
    }

    /// The directories configured for directory OSDs.
    pub fn directory_list(&self) -> Vec<String> {
        split_list(&self.directories)
    }

    /// The timeout of a trigger-and-wait over the given number of targets.
    pub fn trigger_timeout(&self, targets: usize) -> Duration {
        Duration::from_secs(self.trigger_timeout_secs * targets.max(1) as u64)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_secs(self.removal_timeout_secs)
    }

    pub fn unhealthy_threshold(&self) -> Duration {
        Duration::from_secs(self.unhealthy_threshold_secs)
    }

    pub fn quorum_interval(&self) -> Duration {
        Duration::from_secs(self.quorum_interval_secs)
    }

    pub fn format_retry_delay(&self) -> Duration {
        Duration::from_millis(self.format_retry_delay_ms)
    }
}

/// Split a comma or whitespace separated list, dropping empty entries.
pub fn split_list(val: &str) -> Vec<String> {
    val.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn default_log_level() -> String {
    "info".into()
}
fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.into()
}
fn default_config_root() -> String {
    DEFAULT_CONFIG_ROOT.into()
}
fn default_data_path() -> String {
    DEFAULT_DATA_PATH.into()
}
fn default_admin_port() -> u16 {
    8124
}
fn default_metrics_port() -> u16 {
    9124
}
fn default_wal_size_mb() -> u64 {
    crate::osd::scheme::WAL_DEFAULT_SIZE_MB
}
fn default_db_size_mb() -> u64 {
    crate::osd::scheme::DB_DEFAULT_SIZE_MB
}
fn default_journal_size_mb() -> u64 {
    crate::osd::scheme::JOURNAL_DEFAULT_SIZE_MB
}
fn default_ceph_binary() -> String {
    "ceph".into()
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_unhealthy_threshold_secs() -> u64 {
    10
}
fn default_lease_duration_secs() -> u64 {
    15
}
fn default_renew_deadline_secs() -> u64 {
    10
}
fn default_retry_period_secs() -> u64 {
    2
}
fn default_trigger_timeout_secs() -> u64 {
    60
}
fn default_removal_timeout_secs() -> u64 {
    10
}
fn default_quorum_retries() -> u32 {
    20
}
fn default_quorum_interval_secs() -> u64 {
    5
}
fn default_format_retry_delay_ms() -> u64 {
    2000
}

#[cfg(test)]
impl Config {
    /// Build a config for the given node rooted in a fresh temp dir, with timings shortened
    /// for tests.
    pub fn new_test(node_id: &str, public_ip: &str) -> Result<(Self, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir()?;
        let root = tmpdir.path();
        let config: Config = envy::from_iter(vec![
            ("NODE_ID".into(), node_id.into()),
            ("PUBLIC_IP".into(), public_ip.into()),
            ("PRIVATE_IP".into(), public_ip.into()),
            ("CONFIG_ROOT".into(), root.join("config").to_string_lossy().into_owned()),
            ("DATA_PATH".into(), root.join("db").to_string_lossy().into_owned()),
            ("TRIGGER_TIMEOUT_SECS".into(), "5".into()),
            ("REMOVAL_TIMEOUT_SECS".into(), "1".into()),
            ("QUORUM_RETRIES".into(), "3".into()),
            ("QUORUM_INTERVAL_SECS".into(), "0".into()),
            ("FORMAT_RETRY_DELAY_MS".into(), "10".into()),
        ])?;
        config.validate()?;
        Ok((config, tmpdir))
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
