//! Daemon config files.
//!
//! Every daemon reads an INI file with a `[global]` section shared by the whole cluster, a
//! `[client.<user>]` section naming its keyring, and one `[mon.<name>]` section per monitor.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ceph::cluster::ClusterInfo;
use crate::ceph::keyring::{self, ADMIN_USERNAME};
use crate::config::Config;
use crate::osd::scheme::StoreType;

const CONFIG_DIR_MODE: u32 = 0o744;
const LOG_TO_STDOUT: &str = "/dev/stdout";
const DEBUG_SUBSYSTEMS: &[&str] = &["default", "rados", "mon", "osd", "bluestore", "filestore", "journal", "leveldb"];

/// The addresses and networks a node serves on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub public_addr: String,
    pub public_network: String,
    pub cluster_addr: String,
    pub cluster_network: String,
}

impl NetworkInfo {
    pub fn from_config(config: &Config) -> Self {
        let cluster_addr = if config.private_ip.is_empty() {
            config.public_ip.clone()
        } else {
            config.private_ip.clone()
        };
        Self {
            public_addr: config.public_ip.clone(),
            public_network: config.public_network.clone(),
            cluster_addr,
            cluster_network: config.private_network.clone(),
        }
    }
}

/// A section of a config file. Keys keep their insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    /// Set the given key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, val: impl ToString) -> &mut Self {
        let (key, val) = (key.into(), val.to_string());
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = val,
            None => self.entries.push((key, val)),
        }
        self
    }
}

/// An INI config file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub sections: Vec<Section>,
}

impl ConfigFile {
    /// Get the named section, creating it as needed.
    pub fn section(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|sec| sec.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: vec![],
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|sec| sec.name == section)
            .and_then(|sec| sec.entries.iter().find(|(k, _)| k == key))
            .map(|(_, val)| val.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in self.sections.iter() {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, val) in section.entries.iter() {
                out.push_str(&format!("{:<40} = {}\n", key, val));
            }
            out.push('\n');
        }
        out
    }
}

/// What a daemon's config file should hold beyond the cluster defaults.
#[derive(Clone, Debug)]
pub struct ConfigOptions<'a> {
    /// The directory holding the file, also used as the daemon's run dir.
    pub root: &'a Path,
    pub user: &'a str,
    pub keyring: &'a Path,
    pub store_type: StoreType,
    /// Extra `[global]` settings.
    pub global: Vec<(String, String)>,
    /// Extra `[client.<user>]` settings.
    pub client: Vec<(String, String)>,
}

/// Map our log level onto the debug level of the storage daemons.
pub fn debug_level(log_level: &str) -> i32 {
    match log_level {
        "warn" => -1,
        "debug" => 10,
        "trace" => 100,
        _ => 0,
    }
}

/// Prefix `client.` onto a user without a namespace.
pub fn qualified_user(user: &str) -> String {
    if user.contains('.') {
        user.to_string()
    } else {
        format!("client.{}", user)
    }
}

/// `<root>/<cluster>.config`
pub fn conf_file_path(root: &Path, cluster_name: &str) -> PathBuf {
    root.join(format!("{}.config", cluster_name))
}

/// The directory of the node's admin connection config, `<config_root>/<cluster>`.
pub fn admin_root(config: &Config) -> PathBuf {
    Path::new(&config.config_root).join(&config.cluster_name)
}

pub fn admin_keyring_path(config: &Config) -> PathBuf {
    admin_root(config).join(format!("{}.keyring", ADMIN_USERNAME))
}

/// Build the cluster-wide defaults along with the monitor sections.
pub fn default_config(config: &Config, cluster: &ClusterInfo, run_dir: &Path, store_type: StoreType) -> ConfigFile {
    let net = NetworkInfo::from_config(config);
    let level = debug_level(&config.log_level);
    let members: Vec<&str> = cluster.monitors.values().map(|mon| mon.name.as_str()).collect();

    let mut file = ConfigFile::default();
    let global = file.section("global");
    if store_type == StoreType::Bluestore {
        global.set("enable experimental unrecoverable data corrupting features", "bluestore rocksdb");
    }
    global
        .set("fsid", &cluster.fsid)
        .set("run dir", run_dir.display())
        .set("mon initial members", members.join(" "))
        .set("log file", LOG_TO_STDOUT)
        .set("mon cluster log file", LOG_TO_STDOUT)
        .set("public addr", &net.public_addr)
        .set("public network", &net.public_network)
        .set("cluster addr", &net.cluster_addr)
        .set("cluster network", &net.cluster_network)
        .set("mon keyvaluedb", "rocksdb");
    for subsys in DEBUG_SUBSYSTEMS {
        global.set(format!("debug {}", subsys), level);
    }
    global
        .set("filestore_omap_backend", "rocksdb")
        .set("osd pg bits", 11)
        .set("osd pgp bits", 11)
        .set("osd pool default size", 1)
        .set("osd pool default min size", 1)
        .set("osd pool default pg num", 100)
        .set("osd pool default pgp num", 100)
        .set("osd objectstore", store_type)
        .set("rbd_default_features", 3)
        .set("crushtool", "")
        .set("fatal signal handlers", "false");
    if store_type == StoreType::Filestore {
        global.set("osd max object name len", 256).set("osd max object namespace len", 64);
    }
    file
}

/// Render and write a daemon's config file, returning its path.
pub async fn generate_config_file(config: &Config, cluster: &ClusterInfo, opts: ConfigOptions<'_>) -> Result<PathBuf> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(CONFIG_DIR_MODE)
        .create(opts.root)
        .await
        .with_context(|| format!("error creating config directory {}", opts.root.display()))?;

    let mut file = default_config(config, cluster, opts.root, opts.store_type);
    let global = file.section("global");
    for (key, val) in opts.global.iter() {
        global.set(key.as_str(), val);
    }
    let client = file.section(&qualified_user(opts.user));
    client.set("keyring", opts.keyring.display());
    for (key, val) in opts.client.iter() {
        client.set(key.as_str(), val);
    }
    for mon in cluster.monitors.values() {
        file.section(&format!("mon.{}", mon.name))
            .set("name", &mon.name)
            .set("mon addr", &mon.endpoint);
    }

    let path = conf_file_path(opts.root, &cluster.name);
    tracing::debug!(path = %path.display(), "writing config file");
    tokio::fs::write(&path, file.render())
        .await
        .with_context(|| format!("error writing config file {}", path.display()))?;
    Ok(path)
}

/// Write the admin keyring and the matching connection config used by `CephClient::admin`.
pub async fn write_admin_config(config: &Config, cluster: &ClusterInfo) -> Result<PathBuf> {
    let root = admin_root(config);
    let keyring_path = admin_keyring_path(config);
    keyring::write_keyring(&keyring_path, &keyring::admin_keyring(&cluster.admin_secret)).await?;
    generate_config_file(
        config,
        cluster,
        ConfigOptions {
            root: &root,
            user: ADMIN_USERNAME,
            keyring: &keyring_path,
            store_type: config.store_type,
            global: vec![],
            client: vec![],
        },
    )
    .await
    .context("error writing admin connection config")
}
