//! The OSD agent.
//!
//! Once the leader marks the node ready, the agent registers every desired directory and
//! device with the cluster, partitions new devices per the node's partition scheme, creates
//! the OSD filesystems and runs one daemon per OSD. OSDs which were applied but are no longer
//! desired are retired from the cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use regex::Regex;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::scheme::{MetadataDeviceInfo, PartitionType, PerfScheme, SchemeEntry, SchemeStore, StoreConfig, StoreType};
use super::{crush, device, DeviceMapping, AppliedOsd, OSD_BINARY, OSD_SERVICE};
use crate::ceph::cluster::ClusterInfo;
use crate::ceph::config::{self as ceph_config, ConfigOptions};
use crate::ceph::keyring::{self, BOOTSTRAP_OSD_USERNAME};
use crate::ceph::CephClient;
use crate::config::{self, Config};
use crate::context::Context;
use crate::exec::args;
use crate::proc::{ProcHandle, StartPolicy};
use crate::service::ServiceAgent;
use crate::sys;
use castle_core::inventory::{self, Disk};
use castle_core::kvs;
use castle_core::{keys, AppError};

/// The device spec claiming every available device.
const DEVICES_ALL: &str = "all";
const OSD_AUTH_CAPS: [&str; 4] = ["osd", "allow *", "mon", "allow profile osd"];
const BOOTSTRAP_OSD_CAPS: [&str; 2] = ["mon", "allow profile bootstrap-osd"];

/// The agent running this node's OSDs.
#[derive(Default)]
pub struct OsdAgent {
    /// Running OSDs by id.
    procs: Mutex<HashMap<u32, ProcHandle>>,
}

/// An OSD being set up.
struct OsdConfig {
    id: u32,
    uuid: Uuid,
    /// The dir holding the OSD's data dir: the backing dir of a directory OSD, else the config root.
    config_root: PathBuf,
    /// `<config_root>/osd<id>`
    root: PathBuf,
    /// The partitions of a device OSD.
    entry: Option<SchemeEntry>,
}

impl OsdConfig {
    fn new(id: u32, uuid: Uuid, config_root: PathBuf, entry: Option<SchemeEntry>) -> Self {
        Self {
            root: super::osd_root(&config_root, id),
            id,
            uuid,
            config_root,
            entry,
        }
    }

    fn is_bluestore(&self) -> bool {
        matches!(&self.entry, Some(entry) if entry.store_type == StoreType::Bluestore)
    }

    /// Directories and filestore devices share the filestore settings.
    fn store_type(&self) -> StoreType {
        if self.is_bluestore() {
            StoreType::Bluestore
        } else {
            StoreType::Filestore
        }
    }

    fn user(&self) -> String {
        format!("osd.{}", self.id)
    }

    fn keyring(&self) -> PathBuf {
        self.root.join("keyring")
    }

    fn journal(&self) -> PathBuf {
        self.root.join("journal")
    }
}

/// What a single configure pass works with.
struct Pass<'a> {
    ctx: &'a Context,
    cluster: ClusterInfo,
    /// A client acting as the OSD bootstrap identity, which may only register OSDs.
    bootstrap: CephClient,
    store: StoreConfig,
    schemes: SchemeStore,
}

/// The partition scheme planned for this pass.
struct Plan {
    scheme: PerfScheme,
    /// OSDs registered during planning.
    new_ids: BTreeSet<u32>,
}

#[async_trait::async_trait]
impl ServiceAgent for OsdAgent {
    fn name(&self) -> &'static str {
        OSD_SERVICE
    }

    /// Publish the directories and devices this node offers. Without either, the config root
    /// itself backs a directory OSD.
    async fn initialize(&self, ctx: &Context) -> Result<()> {
        let config = ctx.config();
        let mut dirs = config.directory_list();
        if dirs.is_empty() && config.devices.is_empty() {
            dirs.push(config.config_root.clone());
        }
        for dir in dirs.iter() {
            super::add_desired_dir(ctx.kvs(), ctx.cluster(), ctx.node_id(), dir).await?;
        }

        let claim = super::devices_claim_key(ctx.cluster(), ctx.node_id());
        if config.devices.is_empty() {
            ctx.kvs().delete(&claim, false).await?;
        } else {
            kvs::set_if_changed(ctx.kvs(), &claim, &config.devices).await?;
        }
        tracing::debug!(dirs = ?dirs, devices = %config.devices, "published desired osds");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    async fn configure(&self, ctx: &Context) -> Result<()> {
        if ctx.kvs().get(&super::ready_key(ctx.cluster(), ctx.node_id())).await?.as_deref() != Some(keys::MARKER_SET) {
            tracing::debug!("node not marked ready for osds yet");
            return Ok(());
        }

        let cluster = ClusterInfo::must_load(ctx.kvs(), ctx.cluster()).await?;
        ceph_config::write_admin_config(ctx.config(), &cluster).await?;
        let bootstrap_keyring = bootstrap_keyring_path(ctx.config());
        keyring::create_keyring(&ctx.ceph(), &bootstrap_keyring, BOOTSTRAP_OSD_USERNAME, &BOOTSTRAP_OSD_CAPS, keyring::bootstrap_osd_keyring)
            .await
            .context("error creating bootstrap-osd keyring")?;
        let pass = Pass {
            ctx,
            bootstrap: ctx.ceph().with_user(BOOTSTRAP_OSD_USERNAME, &bootstrap_keyring),
            cluster,
            store: StoreConfig::from_config(ctx.config()),
            schemes: SchemeStore::open(&ctx.services.db).await?,
        };

        let dirs = super::load_desired_dirs(ctx.kvs(), ctx.cluster(), ctx.node_id()).await?;
        let stored = super::load_desired_devices(ctx.kvs(), ctx.cluster(), ctx.node_id()).await?;
        let mut desired = super::desired_ids(&dirs, &stored);
        let mut failures = vec![];
        self.configure_dirs(&pass, dirs, &mut desired, &mut failures).await;
        if let Err(err) = self.configure_devices(&pass, &stored, &mut desired, &mut failures).await {
            tracing::error!(error = ?err, "error configuring device osds");
            failures.push(format!("devices: {:#}", err));
        }
        self.stop_undesired(&pass, &desired).await?;

        if !failures.is_empty() {
            bail!("{} osd(s) failed: {}", failures.len(), failures.join("; "));
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &Context) -> Result<()> {
        let mut procs = self.procs.lock().await;
        for (id, handle) in procs.drain() {
            tracing::info!(osd = id, "stopping osd");
            ctx.supervisor().stop(&handle).await?;
        }
        Ok(())
    }
}

impl OsdAgent {
    async fn configure_dirs(&self, pass: &Pass<'_>, dirs: BTreeMap<String, Option<u32>>, desired: &mut BTreeSet<u32>, failures: &mut Vec<String>) {
        for (dir, id) in dirs {
            match self.configure_dir(pass, &dir, id).await {
                Ok(id) => {
                    desired.insert(id);
                }
                Err(err) => {
                    tracing::error!(error = ?err, dir = %dir, "error configuring directory osd");
                    failures.push(format!("dir {}: {:#}", dir, err));
                }
            }
        }
    }

    /// Set up the OSD backed by the given directory. Only a directory without an id is
    /// registered with the cluster; a recorded id whose data dir was never created is created
    /// again from a clean root.
    async fn configure_dir(&self, pass: &Pass<'_>, dir: &str, id: Option<u32>) -> Result<u32> {
        let ctx = pass.ctx;
        let config_root = PathBuf::from(dir);
        let osd = match id {
            Some(id) => {
                let root = super::osd_root(&config_root, id);
                if !is_initialized(&root).await {
                    tracing::info!(osd = id, root = %root.display(), "osd appears to be new, cleaning its root dir");
                    if let Err(err) = tokio::fs::remove_dir_all(&root).await {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(error = ?err, osd = id, "error cleaning osd root dir, proceeding anyway");
                        }
                    }
                }
                // The daemon records the uuid at creation; a nil uuid lets it pick one.
                OsdConfig::new(id, Uuid::nil(), config_root, None)
            }
            None => {
                let (id, uuid) = register(&pass.bootstrap).await?;
                super::associate_dir(ctx.kvs(), ctx.cluster(), ctx.node_id(), dir, id).await?;
                OsdConfig::new(id, uuid, config_root, None)
            }
        };
        self.start_osd(pass, osd).await
    }

    async fn configure_devices(
        &self, pass: &Pass<'_>, stored: &BTreeMap<String, DeviceMapping>, desired: &mut BTreeSet<u32>, failures: &mut Vec<String>,
    ) -> Result<()> {
        let ctx = pass.ctx;
        let config = ctx.config();
        let disks = ctx.local_node().map(|node| node.disks.clone()).unwrap_or_default();
        let names = resolve_devices(config, &disks)?;
        if names.is_empty() && stored.is_empty() && config.metadata_device.is_empty() {
            return Ok(());
        }
        let mapping = device_mapping(&names, &config.metadata_device, stored, &disks);
        let mut desired_disks: BTreeSet<String> = stored.keys().cloned().collect();
        desired_disks.extend(
            mapping
                .keys()
                .filter_map(|name| disks.iter().find(|disk| &disk.name == name && !disk.uuid.is_empty()))
                .map(|disk| disk.uuid.clone()),
        );

        let mut committed = pass.schemes.load().await?;
        let plan = self.plan(pass, &mut committed, &mapping, &disks).await?;
        desired.extend(plan.new_ids.iter().copied());

        if let Some(meta) = plan.scheme.metadata.as_ref().filter(|meta| !meta.partitions.is_empty()) {
            device::partition_metadata(ctx.executor(), meta, committed.metadata.as_ref(), config.format_retry_delay()).await?;
            if committed.metadata.as_ref() != Some(meta) {
                committed.metadata = Some(meta.clone());
                pass.schemes.save(&committed).await?;
                inventory::set_disk_uuid(ctx.kvs(), ctx.node_id(), &meta.device, &meta.disk_uuid).await?;
            }
            super::associate_metadata(ctx.kvs(), ctx.cluster(), ctx.node_id(), &meta.disk_uuid, &meta.osd_ids()).await?;
        }

        for entry in plan.scheme.entries.iter() {
            let data_disk = entry.data_details().map(|data| data.disk_uuid.clone()).unwrap_or_default();
            if !plan.new_ids.contains(&entry.id) && !desired_disks.contains(&data_disk) {
                tracing::debug!(osd = entry.id, "device of osd is no longer desired");
                continue;
            }
            match self.configure_device(pass, entry, &mut committed).await {
                Ok(id) => {
                    desired.insert(id);
                }
                Err(err) => {
                    tracing::error!(error = ?err, osd = entry.id, "error configuring device osd");
                    failures.push(format!("osd {}: {:#}", entry.id, err));
                }
            }
        }
        Ok(())
    }

    /// Compute the partition scheme for the desired devices, registering an OSD for every
    /// device which needs a data partition.
    ///
    /// Devices already in the committed scheme only get their current names recorded. A new
    /// data device is laid out against the metadata device if there is one, else all of its
    /// partitions are collocated.
    async fn plan(&self, pass: &Pass<'_>, committed: &mut PerfScheme, mapping: &BTreeMap<String, DeviceMapping>, disks: &[Disk]) -> Result<Plan> {
        let ctx = pass.ctx;
        let config = ctx.config();
        let disk_uuid = |name: &str| -> String {
            disks
                .iter()
                .find(|disk| disk.name == name)
                .map(|disk| disk.uuid.clone())
                .unwrap_or_default()
        };

        let mut renamed = false;
        for name in mapping.keys() {
            renamed |= committed.refresh_device_name(&disk_uuid(name), name);
        }
        if renamed {
            tracing::info!("device names changed, updating the partition scheme");
            pass.schemes.save(committed).await?;
        }

        let mut metadata = committed
            .metadata
            .clone()
            .filter(|meta| !meta.partitions.is_empty() && meta.device == config.metadata_device);
        let mut new_data = vec![];
        for (name, dev) in mapping.iter() {
            if committed.uses_disk(&disk_uuid(name)) {
                continue;
            }
            if dev.wants_data() {
                new_data.push(name.clone());
            } else if dev.wants_metadata() {
                if let Some(existing) = committed.metadata.as_ref().or(metadata.as_ref()) {
                    if existing.device == *name {
                        continue;
                    }
                    bail!("{} is desired for metadata, but {} ({}) already is the metadata device", name, existing.device, existing.disk_uuid);
                }
                match device::check_available(ctx.executor(), name, config.force_format).await {
                    Ok(()) => metadata = Some(MetadataDeviceInfo::new(name)),
                    Err(err) if device::is_hazard(&err) => tracing::warn!(error = %err, "skipping metadata device"),
                    Err(err) => return Err(err),
                }
            }
        }

        let mut scheme = committed.clone();
        let mut new_ids = BTreeSet::new();
        for name in new_data {
            match device::check_available(ctx.executor(), &name, config.force_format).await {
                Ok(()) => (),
                Err(err) if device::is_hazard(&err) => {
                    tracing::warn!(error = %err, "skipping device");
                    continue;
                }
                Err(err) => return Err(err),
            }
            let (id, uuid) = register(&pass.bootstrap)
                .await
                .with_context(|| format!("error registering osd for device {}", name))?;
            let mut entry = SchemeEntry::new(id, uuid, pass.store.store_type);
            match metadata.as_mut() {
                Some(meta) => entry.populate_distributed(&name, meta, &pass.store)?,
                None => entry.populate_collocated(&name, &pass.store),
            }
            tracing::info!(osd = id, device = %name, collocated = entry.is_collocated(), "planned osd");
            new_ids.insert(id);
            scheme.entries.push(entry);
        }
        scheme.metadata = metadata.or_else(|| committed.metadata.clone());
        Ok(Plan { scheme, new_ids })
    }

    /// Partition the device of the given OSD unless that was committed before, then start it.
    async fn configure_device(&self, pass: &Pass<'_>, entry: &SchemeEntry, committed: &mut PerfScheme) -> Result<u32> {
        let ctx = pass.ctx;
        let config_root = PathBuf::from(&ctx.config().config_root);
        let root = super::osd_root(&config_root, entry.id);
        let data = entry.data_details()?;

        if committed.entry(entry.id).is_none() {
            device::partition_osd(ctx.executor(), entry, &root, ctx.config().format_retry_delay()).await?;
            committed.entries.push(entry.clone());
            pass.schemes.save(committed).await?;
            inventory::set_disk_uuid(ctx.kvs(), ctx.node_id(), &data.device, &data.disk_uuid).await?;
        } else {
            device::ensure_mounted(ctx.executor(), entry, &root).await?;
        }
        super::associate_device(ctx.kvs(), ctx.cluster(), ctx.node_id(), &data.disk_uuid, entry.id).await?;
        if entry.is_collocated() {
            super::associate_metadata(ctx.kvs(), ctx.cluster(), ctx.node_id(), &data.disk_uuid, &entry.id.to_string()).await?;
        }

        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("error creating osd dir {}", root.display()))?;
        device::link_partitions(entry, &root).await?;
        self.start_osd(pass, OsdConfig::new(entry.id, entry.osd_uuid, config_root, Some(entry.clone())))
            .await
    }

    /// Create the OSD unless its data dir already names it, then run it.
    async fn start_osd(&self, pass: &Pass<'_>, mut osd: OsdConfig) -> Result<u32> {
        if is_initialized(&osd.root).await {
            if let Err(err) = write_config_file(pass, &osd).await {
                tracing::warn!(error = ?err, osd = osd.id, "error updating osd config file");
            }
            let (id, uuid) = load_osd_info(&osd.root).await?;
            osd.id = id;
            osd.uuid = uuid;
        } else {
            tokio::fs::create_dir_all(&osd.root)
                .await
                .with_context(|| format!("error creating osd dir {}", osd.root.display()))?;
            initialize_osd(pass, &osd).await.with_context(|| format!("error creating osd {}", osd.id))?;
            if osd.uuid.is_nil() {
                let (_, uuid) = load_osd_info(&osd.root).await?;
                osd.uuid = uuid;
            }
        }
        // Placement follows the node's location and the OSD's capacity, both of which may change.
        add_to_crush_map(pass, &osd).await?;
        mark_applied(pass, &osd).await?;
        self.run_osd(pass, &osd).await?;
        Ok(osd.id)
    }

    async fn run_osd(&self, pass: &Pass<'_>, osd: &OsdConfig) -> Result<()> {
        let mut procs = self.procs.lock().await;
        if procs.contains_key(&osd.id) {
            return Ok(());
        }

        let uuid_arg = format!("--osd-uuid={}", osd.uuid);
        let mut daemon = args([
            "--foreground".to_string(),
            format!("--id={}", osd.id),
            format!("--cluster={}", pass.cluster.name),
            format!("--osd-data={}", osd.root.display()),
            format!("--conf={}", ceph_config::conf_file_path(&osd.root, &pass.cluster.name).display()),
            format!("--keyring={}", osd.keyring().display()),
            uuid_arg.clone(),
        ]);
        if !osd.is_bluestore() {
            daemon.push(format!("--osd-journal={}", osd.journal().display()));
        }

        let name = format!("osd{}", osd.id);
        let handle = pass
            .ctx
            .supervisor()
            .start(&name, OSD_BINARY, &regex::escape(&uuid_arg), StartPolicy::ReuseExisting, &daemon)
            .await
            .with_context(|| format!("error starting osd {}", osd.id))?;
        if let Some(handle) = handle {
            tracing::info!(osd = osd.id, root = %osd.root.display(), "started osd");
            procs.insert(osd.id, handle);
        }
        Ok(())
    }

    /// Retire every OSD applied on this node which is no longer desired.
    async fn stop_undesired(&self, pass: &Pass<'_>, desired: &BTreeSet<u32>) -> Result<()> {
        let ctx = pass.ctx;
        let applied = super::load_applied(ctx.kvs(), ctx.cluster(), ctx.node_id()).await?;
        let mut failed = vec![];
        for id in applied.keys().filter(|id| !desired.contains(*id)) {
            if let Err(err) = self.retire(ctx, *id).await {
                tracing::error!(error = ?err, osd = id, "error retiring osd");
                failed.push(*id);
            }
        }
        if !failed.is_empty() {
            bail!("error retiring osds {:?}", failed);
        }
        Ok(())
    }

    async fn retire(&self, ctx: &Context, id: u32) -> Result<()> {
        tracing::info!(osd = id, "retiring osd which is no longer desired");
        let client = ctx.ceph();
        let entity = format!("osd.{}", id);
        client.osd_out(id).await.with_context(|| format!("error marking {} out", entity))?;

        let handle = self.procs.lock().await.remove(&id);
        match handle {
            Some(handle) => ctx.supervisor().stop(&handle).await?,
            None => {
                let signature = format!("{}( |$)", regex::escape(&format!("--id={}", id)));
                ctx.supervisor().stop_matching(OSD_BINARY, &signature).await?;
            }
        }

        client
            .osd_crush_remove(&entity)
            .await
            .with_context(|| format!("error removing {} from the crush map", entity))?;
        client.auth_del(&entity).await.with_context(|| format!("error removing auth of {}", entity))?;
        client.osd_rm(id).await.with_context(|| format!("error removing {}", entity))?;
        ctx.kvs()
            .delete(&super::applied_osd_key(ctx.cluster(), ctx.node_id(), id), true)
            .await
    }
}

/// Resolve the configured device spec against the disks of this node. The metadata device is
/// never a data device.
pub(super) fn resolve_devices(config: &Config, disks: &[Disk]) -> Result<Vec<String>> {
    if config.devices.is_empty() {
        return Ok(vec![]);
    }
    let candidates: Vec<&str> = sys::candidate_disks(disks)
        .map(|disk| disk.name.as_str())
        .filter(|name| *name != config.metadata_device)
        .collect();

    if config.devices == DEVICES_ALL {
        return Ok(candidates.into_iter().map(String::from).collect());
    }
    if config.using_device_filter {
        let filter = Regex::new(&config.devices)
            .map_err(|err| AppError::ConfigInvalid(format!("invalid device filter {:?}: {}", config.devices, err)))?;
        return Ok(candidates.into_iter().filter(|name| filter.is_match(name)).map(String::from).collect());
    }

    let mut names = vec![];
    for name in config::split_list(&config.devices) {
        if candidates.contains(&name.as_str()) {
            names.push(name);
        } else {
            tracing::warn!(device = %name, "configured device not found on this node");
        }
    }
    Ok(names)
}

/// Merge the configured devices with the devices recorded in the desired state, by current
/// device name.
pub(super) fn device_mapping(names: &[String], metadata_device: &str, stored: &BTreeMap<String, DeviceMapping>, disks: &[Disk]) -> BTreeMap<String, DeviceMapping> {
    let mut mapping: BTreeMap<String, DeviceMapping> = names.iter().map(|name| (name.clone(), DeviceMapping::default())).collect();
    if !metadata_device.is_empty() {
        mapping.entry(metadata_device.to_string()).or_insert(DeviceMapping {
            data: None,
            metadata: Some(vec![]),
        });
    }
    for (disk_uuid, dev) in stored.iter() {
        match disks.iter().find(|disk| &disk.uuid == disk_uuid) {
            Some(disk) => {
                mapping.insert(disk.name.clone(), dev.clone());
            }
            None => tracing::warn!(disk_uuid = %disk_uuid, "no device on this node has the desired disk uuid"),
        }
    }
    mapping
}

/// Register a new OSD with the cluster under a fresh uuid.
async fn register(client: &CephClient) -> Result<(u32, Uuid)> {
    let uuid = Uuid::new_v4();
    let id = client
        .osd_create(&uuid.to_string())
        .await
        .with_context(|| format!("error registering osd {}", uuid))?;
    tracing::info!(osd = id, uuid = %uuid, "registered osd");
    Ok((id, uuid))
}

fn bootstrap_keyring_path(config: &Config) -> PathBuf {
    Path::new(&config.config_root)
        .join("bootstrap-osd")
        .join(format!("{}.keyring", config.cluster_name))
}

/// An OSD data dir is initialized once the daemon wrote its `whoami` there.
async fn is_initialized(root: &Path) -> bool {
    tokio::fs::metadata(root.join("whoami")).await.is_ok()
}

/// Read the id and uuid the daemon recorded in an OSD data dir.
async fn load_osd_info(root: &Path) -> Result<(u32, Uuid)> {
    let whoami = root.join("whoami");
    let raw = tokio::fs::read_to_string(&whoami)
        .await
        .with_context(|| format!("error reading osd id from {}", whoami.display()))?;
    let id = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid osd id {:?} in {}", raw, whoami.display()))?;

    let fsid = root.join("fsid");
    let raw = tokio::fs::read_to_string(&fsid)
        .await
        .with_context(|| format!("error reading osd uuid from {}", fsid.display()))?;
    let uuid = Uuid::parse_str(raw.trim()).with_context(|| format!("invalid osd uuid {:?} in {}", raw, fsid.display()))?;
    Ok((id, uuid))
}

async fn write_config_file(pass: &Pass<'_>, osd: &OsdConfig) -> Result<PathBuf> {
    let mut global = vec![];
    match &osd.entry {
        Some(entry) if entry.store_type == StoreType::Bluestore => {
            for (kind, key) in [
                (PartitionType::Wal, "bluestore block wal path"),
                (PartitionType::Db, "bluestore block db path"),
                (PartitionType::Block, "bluestore block path"),
            ] {
                let part = entry
                    .partitions
                    .get(&kind)
                    .with_context(|| format!("{:?} partition missing from scheme of osd {}", kind, osd.id))?;
                global.push((key.to_string(), sys::partuuid_path(&part.partition_uuid)));
            }
        }
        _ => global.push(("osd journal size".to_string(), pass.store.journal_size().to_string())),
    }

    let (user, keyring) = (osd.user(), osd.keyring());
    ceph_config::generate_config_file(
        pass.ctx.config(),
        &pass.cluster,
        ConfigOptions {
            root: &osd.root,
            user: &user,
            keyring: &keyring,
            store_type: osd.store_type(),
            global,
            client: vec![],
        },
    )
    .await
}

/// Create the OSD's filesystem and key, then grant it its caps.
async fn initialize_osd(pass: &Pass<'_>, osd: &OsdConfig) -> Result<()> {
    let ctx = pass.ctx;
    let conf = write_config_file(pass, osd).await?;

    let monmap = osd.root.join("tmp").join("activate.monmap");
    if let Some(parent) = monmap.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("error creating {}", parent.display()))?;
    }
    ctx.ceph().mon_getmap(&monmap).await.context("error fetching the monitor map")?;

    tracing::info!(osd = osd.id, root = %osd.root.display(), "creating osd filesystem");
    let mut mkfs = args([
        "--mkfs".to_string(),
        "--mkkey".to_string(),
        format!("--id={}", osd.id),
        format!("--cluster={}", pass.cluster.name),
        format!("--conf={}", conf.display()),
        format!("--osd-data={}", osd.root.display()),
        format!("--osd-uuid={}", osd.uuid),
        format!("--monmap={}", monmap.display()),
        format!("--keyring={}", osd.keyring().display()),
    ]);
    if !osd.is_bluestore() {
        mkfs.push(format!("--osd-journal={}", osd.journal().display()));
    }
    ctx.supervisor()
        .run(&format!("mkfs-osd{}", osd.id), OSD_BINARY, &mkfs)
        .await
        .with_context(|| format!("error creating filesystem of osd {} at {}", osd.id, osd.root.display()))?;

    ctx.ceph()
        .auth_add(&osd.user(), &osd.keyring(), &OSD_AUTH_CAPS)
        .await
        .with_context(|| format!("error granting caps to {}", osd.user()))?;
    Ok(())
}

/// Place the OSD under this node in the CRUSH map, weighted by its capacity.
async fn add_to_crush_map(pass: &Pass<'_>, osd: &OsdConfig) -> Result<()> {
    let ctx = pass.ctx;
    let total = match &osd.entry {
        // Bluestore data partitions are raw, so ask the device instead of the filesystem.
        Some(entry) if osd.is_bluestore() => {
            let path = sys::partuuid_path(&entry.data_details()?.partition_uuid);
            device::wait_for_path(ctx.executor(), &path).await?;
            sys::device_size(ctx.executor(), &path).await?
        }
        _ => sys::filesystem_size(&osd.root)?,
    };
    if total == 0 {
        bail!("could not determine the capacity of osd {}", osd.id);
    }

    let weight = crush::weight(total);
    let location = crush::format_location(&ctx.config().location, ctx.node_id())?;
    tracing::info!(osd = osd.id, bytes = total, weight = %crush::format_weight(weight), location = ?location, "adding osd to crush map");
    ctx.ceph()
        .osd_crush_create_or_move(osd.id, weight, &location)
        .await
        .with_context(|| format!("error adding osd {} to the crush map", osd.id))?;
    inventory::set_location(ctx.kvs(), ctx.node_id(), &location.join(",")).await
}

async fn mark_applied(pass: &Pass<'_>, osd: &OsdConfig) -> Result<()> {
    let ctx = pass.ctx;
    let applied = match &osd.entry {
        Some(entry) => AppliedOsd {
            path: osd.config_root.display().to_string(),
            data_disk_uuid: entry.data_details()?.disk_uuid.clone(),
            metadata_disk_uuid: entry.metadata_details()?.disk_uuid.clone(),
        },
        None => AppliedOsd {
            path: osd.config_root.display().to_string(),
            ..Default::default()
        },
    };
    super::store_applied(ctx.kvs(), ctx.cluster(), ctx.node_id(), osd.id, &applied).await
}
