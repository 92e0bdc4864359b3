//! Test doubles and a multi-node harness.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::prelude::*;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::agent::AgentCtl;
use crate::bus::{RefreshEvent, RefreshReason};
use crate::config::Config;
use crate::context::{Context, Services};
use crate::database::Database;
use crate::exec::{command_to_string, Executor};
use crate::orchestrator;
use crate::proc::{ProcHandle, StartPolicy, Supervisor};
use crate::service;
use castle_core::inventory::{self, Disk, NodeConfig, DISK_TYPE_DISK};
use castle_core::keys;
use castle_core::kvs::{Kvs, MemKvs};

/// The bytes reported for every simulated partition.
pub const PARTITION_SIZE: u64 = 10 * 1024 * 1024 * 1024;
/// The key handed out by the simulated admin tool.
pub const TEST_KEY: &str = "AQBcYmlyZHNhbmRiZWVzCg==";

type Responder = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// An executor which records every command and answers from registered rules.
///
/// Rules are regexes matched against the full command line; the most recently registered match
/// wins. Commands without a matching rule succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<(Regex, Responder)>>,
    commands: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor simulating a healthy cluster admin tool along with empty host devices.
    pub fn with_cluster() -> Self {
        let exec = Self::new();
        exec.on("lsblk /dev/disk/by-partuuid/", &PARTITION_SIZE.to_string());
        exec.on("^ceph mon_status", &quorum_status(&(0..10).map(|idx| format!("mon{}", idx)).collect::<Vec<_>>()));
        exec.on("^ceph auth get-or-create-key", &format!(r#"{{"key":"{}"}}"#, TEST_KEY));

        let osd_ids: Arc<Mutex<HashMap<String, u32>>> = Default::default();
        exec.on_fn("^ceph osd create ", move |cmd| {
            let uuid = cmd.split_whitespace().nth(3).unwrap_or_default().to_string();
            let mut ids = osd_ids.lock().map_err(|_| anyhow!("poisoned"))?;
            let next = ids.len() as u32;
            let id = *ids.entry(uuid).or_insert(next);
            Ok(format!(r#"{{"osdid":{}}}"#, id))
        });

        let filesystems: Arc<Mutex<BTreeSet<String>>> = Default::default();
        let fs_new = filesystems.clone();
        exec.on_fn("^ceph fs new ", move |cmd| {
            let name = cmd.split_whitespace().nth(3).unwrap_or_default().to_string();
            fs_new.lock().map_err(|_| anyhow!("poisoned"))?.insert(name);
            Ok(String::new())
        });
        let fs_rm = filesystems.clone();
        exec.on_fn("^ceph fs rm ", move |cmd| {
            let name = cmd.split_whitespace().nth(3).unwrap_or_default().to_string();
            fs_rm.lock().map_err(|_| anyhow!("poisoned"))?.remove(&name);
            Ok(String::new())
        });
        exec.on_fn("^ceph fs ls", move |_| {
            let names = filesystems.lock().map_err(|_| anyhow!("poisoned"))?;
            let entries: Vec<String> = names.iter().map(|name| format!(r#"{{"name":"{}"}}"#, name)).collect();
            Ok(format!("[{}]", entries.join(",")))
        });
        exec.on_fn("^ceph fs get ", |cmd| {
            let name = cmd.split_whitespace().nth(3).unwrap_or_default();
            Ok(format!(r#"{{"mdsmap":{{"fs_name":"{}","info":{{"gid_4100":{{"gid":4100,"name":"mds1"}}}}}}}}"#, name))
        });
        exec
    }

    /// Answer commands matching `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: &str) {
        let output = output.to_string();
        self.on_fn(pattern, move |_| Ok(output.clone()));
    }

    /// Fail commands matching `pattern` with the given message.
    pub fn fail(&self, pattern: &str, msg: &str) {
        let msg = msg.to_string();
        self.on_fn(pattern, move |_| Err(anyhow!(msg.clone())));
    }

    pub fn on_fn<F>(&self, pattern: &str, f: F)
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        let pattern = match Regex::new(pattern) {
            Ok(pattern) => pattern,
            Err(err) => panic!("invalid mock pattern {:?}: {}", pattern, err),
        };
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((pattern, Arc::new(f)));
        }
    }

    /// Every command executed so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|cmds| cmds.clone()).unwrap_or_default()
    }

    /// The executed commands matching `pattern`.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        let pattern = match Regex::new(pattern) {
            Ok(pattern) => pattern,
            Err(err) => panic!("invalid pattern {:?}: {}", pattern, err),
        };
        self.commands().into_iter().filter(|cmd| pattern.is_match(cmd)).collect()
    }

    /// Simulate a host with the given `(name, size, uuid)` whole disks, none of them in use.
    pub fn with_disks(&self, disks: &[(&str, u64, &str)]) {
        let listing: Vec<String> = disks
            .iter()
            .map(|(name, size, _)| format!(r#"NAME="{}" SIZE="{}" TYPE="disk" PKNAME="""#, name, size))
            .collect();
        self.on("^lsblk --all", &listing.join("\n"));
        for (name, _, uuid) in disks {
            self.on(&format!("^udevadm info --query=property /dev/{}$", name), &format!("ID_PART_TABLE_UUID={}\n", uuid));
        }
    }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<String> {
        let cmd = command_to_string(program, args);
        if let Ok(mut cmds) = self.commands.lock() {
            cmds.push(cmd.clone());
        }
        let responder = self
            .rules
            .lock()
            .map_err(|_| anyhow!("mock rules poisoned"))?
            .iter()
            .rev()
            .find(|(pattern, _)| pattern.is_match(&cmd))
            .map(|(_, responder)| responder.clone());
        match responder {
            Some(responder) => responder(&cmd),
            None => Ok(String::new()),
        }
    }

    async fn stat(&self, path: &Path) -> Result<bool> {
        // Simulated devices always exist.
        if path.starts_with("/dev") {
            return Ok(true);
        }
        Ok(tokio::fs::metadata(path).await.is_ok())
    }
}

/// A `mon_status` document with every given monitor in quorum.
pub fn quorum_status(names: &[String]) -> String {
    let mons: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(rank, name)| format!(r#"{{"name":"{}","rank":{}}}"#, name, rank))
        .collect();
    let ranks: Vec<String> = (0..names.len()).map(|rank| rank.to_string()).collect();
    format!(r#"{{"quorum":[{}],"monmap":{{"mons":[{}]}}}}"#, ranks.join(","), mons.join(","))
}

/// A process as seen by the fake supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeProc {
    pub name: String,
    pub binary: String,
    pub signature: String,
    pub args: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    running: BTreeMap<u64, FakeProc>,
    starts: Vec<FakeProc>,
    runs: Vec<FakeProc>,
    stops: Vec<String>,
}

/// A supervisor which records what it is asked to do. One-shot `--mkfs` runs of the storage
/// daemons write the files the real daemons would.
#[derive(Default)]
pub struct FakeSupervisor {
    state: Mutex<FakeState>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        self.state.lock().map_err(|_| anyhow!("fake supervisor poisoned"))
    }

    /// Every process started so far, in order.
    pub fn starts(&self) -> Vec<FakeProc> {
        self.state().map(|state| state.starts.clone()).unwrap_or_default()
    }

    /// Every one-shot command run so far, in order.
    pub fn runs(&self) -> Vec<FakeProc> {
        self.state().map(|state| state.runs.clone()).unwrap_or_default()
    }

    /// The names of every process stopped so far, in order.
    pub fn stops(&self) -> Vec<String> {
        self.state().map(|state| state.stops.clone()).unwrap_or_default()
    }

    /// The processes currently running.
    pub fn running(&self) -> Vec<FakeProc> {
        self.state().map(|state| state.running.values().cloned().collect()).unwrap_or_default()
    }

    /// Check if a process with the given binary and an argument containing `needle` is running.
    pub fn is_running(&self, binary: &str, needle: &str) -> bool {
        self.running().iter().any(|proc| proc.binary == binary && proc.args.iter().any(|arg| arg.contains(needle)))
    }
}

fn matches_signature(proc: &FakeProc, binary: &str, signature: &Regex) -> bool {
    proc.binary == binary && signature.is_match(&proc.args.join(" "))
}

/// The value of a `--flag=value` argument.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')))
}

#[async_trait::async_trait]
impl Supervisor for FakeSupervisor {
    async fn run(&self, name: &str, binary: &str, args: &[String]) -> Result<()> {
        self.state()?.runs.push(FakeProc {
            name: name.into(),
            binary: binary.into(),
            signature: String::new(),
            args: args.to_vec(),
        });
        if !args.iter().any(|arg| arg == "--mkfs") {
            return Ok(());
        }
        match binary {
            "ceph-mon" => {
                let data = flag_value(args, "--mon-data").context("mon mkfs without --mon-data")?;
                tokio::fs::create_dir_all(data).await?;
                tokio::fs::write(Path::new(data).join("kv_backend"), "rocksdb\n").await?;
            }
            "ceph-osd" => {
                let data = flag_value(args, "--osd-data").context("osd mkfs without --osd-data")?;
                let id = flag_value(args, "--id").context("osd mkfs without --id")?;
                let uuid = flag_value(args, "--osd-uuid").context("osd mkfs without --osd-uuid")?;
                tokio::fs::create_dir_all(data).await?;
                tokio::fs::write(Path::new(data).join("whoami"), format!("{}\n", id)).await?;
                tokio::fs::write(Path::new(data).join("fsid"), format!("{}\n", uuid)).await?;
            }
            _ => (),
        }
        Ok(())
    }

    async fn start(&self, name: &str, binary: &str, signature: &str, policy: StartPolicy, args: &[String]) -> Result<Option<ProcHandle>> {
        let pattern = Regex::new(signature)?;
        let mut state = self.state()?;
        let existing: Vec<u64> = state
            .running
            .iter()
            .filter(|(_, proc)| matches_signature(proc, binary, &pattern))
            .map(|(id, _)| *id)
            .collect();
        if !existing.is_empty() {
            if policy == StartPolicy::ReuseExisting {
                return Ok(None);
            }
            for id in existing {
                if let Some(proc) = state.running.remove(&id) {
                    state.stops.push(proc.name);
                }
            }
        }
        let proc = FakeProc {
            name: name.into(),
            binary: binary.into(),
            signature: signature.into(),
            args: args.to_vec(),
        };
        let id = state.next_id;
        state.next_id += 1;
        state.starts.push(proc.clone());
        state.running.insert(id, proc);
        Ok(Some(ProcHandle { id, name: name.into() }))
    }

    async fn stop(&self, handle: &ProcHandle) -> Result<()> {
        let mut state = self.state()?;
        if state.running.remove(&handle.id).is_some() {
            state.stops.push(handle.name.clone());
        }
        Ok(())
    }

    async fn stop_matching(&self, binary: &str, signature: &str) -> Result<usize> {
        let pattern = Regex::new(signature)?;
        let mut state = self.state()?;
        let ids: Vec<u64> = state
            .running
            .iter()
            .filter(|(_, proc)| matches_signature(proc, binary, &pattern))
            .map(|(id, _)| *id)
            .collect();
        for id in ids.iter() {
            if let Some(proc) = state.running.remove(id) {
                state.stops.push(proc.name);
            }
        }
        Ok(ids.len())
    }

    async fn stop_all(&self) {
        if let Ok(mut state) = self.state() {
            let names: Vec<String> = state.running.values().map(|proc| proc.name.clone()).collect();
            state.stops.extend(names);
            state.running.clear();
        }
    }
}

/// A healthy inventory record for the given node.
pub fn node(node_id: &str, ip: &str) -> NodeConfig {
    NodeConfig {
        node_id: node_id.into(),
        public_ip: ip.into(),
        private_ip: ip.into(),
        heartbeat: Some(Utc::now()),
        location: String::new(),
        disks: vec![],
    }
}

/// A whole disk with the given partition table GUID.
pub fn disk(name: &str, uuid: &str) -> Disk {
    Disk {
        name: name.into(),
        size: 100 * PARTITION_SIZE,
        uuid: uuid.into(),
        disk_type: DISK_TYPE_DISK.into(),
        parent: String::new(),
    }
}

/// Age the heartbeat of the given node past the unhealthy threshold.
pub async fn make_unhealthy(kvs: &dyn Kvs, node_id: &str) -> Result<()> {
    inventory::set_heartbeat(kvs, node_id, Utc::now() - chrono::Duration::seconds(11)).await
}

/// A node of the harness.
pub struct TestNode {
    pub services: Arc<Services>,
    pub supervisor: Arc<FakeSupervisor>,
    shutdown_tx: broadcast::Sender<()>,
    agents: Vec<JoinHandle<Result<()>>>,
    _tmpdir: tempfile::TempDir,
}

impl TestNode {
    pub fn config_root(&self) -> PathBuf {
        PathBuf::from(&self.services.config.config_root)
    }

    pub async fn context(&self) -> Result<Context> {
        Context::load(&self.services).await
    }
}

/// Many nodes sharing one store and one simulated host, each running every agent.
pub struct TestCluster {
    pub kvs: Arc<MemKvs>,
    pub executor: Arc<MockExecutor>,
    pub nodes: BTreeMap<String, TestNode>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            kvs: Arc::new(MemKvs::new()),
            executor: Arc::new(MockExecutor::with_cluster()),
            nodes: BTreeMap::new(),
        }
    }

    /// Add a node to the inventory and start its agents.
    pub async fn add_node(&mut self, node_id: &str, ip: &str) -> Result<()> {
        self.add_node_with(node(node_id, ip), |_| ()).await
    }

    /// Add the given node record to the inventory, adjusting its config before its agents start.
    pub async fn add_node_with<F>(&mut self, record: NodeConfig, configure: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let (mut config, tmpdir) = Config::new_test(&record.node_id, &record.public_ip)?;
        configure(&mut config);
        let config = Arc::new(config);
        inventory::store_node(self.kvs.as_ref(), &record).await?;

        let db = Database::new(config.clone()).await?;
        let supervisor = Arc::new(FakeSupervisor::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let services = Arc::new(Services {
            config,
            kvs: self.kvs.clone(),
            executor: self.executor.clone(),
            supervisor: supervisor.clone(),
            db,
            shutdown_tx: shutdown_tx.clone(),
        });
        let agents = service::agents()
            .into_iter()
            .map(|agent| AgentCtl::new(services.clone(), agent, shutdown_tx.subscribe()).spawn())
            .collect();

        // Wait for the startup pass of every agent so that it cannot race the first trigger.
        for agent in service::agents() {
            self.wait_for_status(&record.node_id, agent.name()).await?;
        }
        self.nodes.insert(
            record.node_id.clone(),
            TestNode {
                services,
                supervisor,
                shutdown_tx,
                agents,
                _tmpdir: tmpdir,
            },
        );
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Result<&TestNode> {
        self.nodes.get(node_id).with_context(|| format!("unknown test node {}", node_id))
    }

    async fn wait_for_status(&self, node_id: &str, service: &str) -> Result<()> {
        let key = keys::status_key(node_id, service);
        for _ in 0..200 {
            if self.kvs.get(&key).await?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("agent {} on node {} never reported", service, node_id)
    }

    /// Run a full leader pass from the given node, failing if any service leader failed.
    pub async fn refresh(&self, leader: &str) -> Result<()> {
        self.refresh_with(leader, RefreshEvent::new(RefreshReason::Manual)).await
    }

    pub async fn refresh_with(&self, leader: &str, event: RefreshEvent) -> Result<()> {
        let node = self.node(leader)?;
        let failures = orchestrator::refresh(&node.services, &service::leaders(), &event).await?;
        if let Some((name, err)) = failures.into_iter().next() {
            return Err(err.context(format!("{} leader failed", name)));
        }
        Ok(())
    }

    /// Stop the agents of every node.
    pub async fn shutdown(self) -> Result<()> {
        for (_, node) in self.nodes {
            let _ = node.shutdown_tx.send(());
            for handle in node.agents {
                handle.await??;
            }
        }
        Ok(())
    }
}
