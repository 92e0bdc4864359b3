//! OSD partition schemes.
//!
//! A scheme describes where every partition of every device-backed OSD on a node lives. It is
//! planned before partitioning, committed to the node-local database once partitioning
//! succeeds, and consulted on every later reconcile to decide whether a device still needs
//! work.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::database::{Database, Tree};

pub const WAL_DEFAULT_SIZE_MB: u64 = 576;
pub const DB_DEFAULT_SIZE_MB: u64 = 20480;
pub const JOURNAL_DEFAULT_SIZE_MB: u64 = 5120;

/// Partitions start 1 MiB into the device.
const FIRST_OFFSET_MB: u64 = 1;
const SECTORS_PER_MB: u64 = 2048;
/// The key of the scheme document inside the scheme tree.
const KEY_SCHEME: &str = "partition-scheme";

/// The OSD store backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Filestore,
    Bluestore,
}

impl Default for StoreType {
    fn default() -> Self {
        StoreType::Bluestore
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Filestore => write!(f, "filestore"),
            StoreType::Bluestore => write!(f, "bluestore"),
        }
    }
}

/// The role of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    Wal,
    Db,
    Block,
    FsData,
}

impl PartitionType {
    fn label_suffix(&self) -> &'static str {
        match self {
            PartitionType::Wal => "WAL",
            PartitionType::Db => "DB",
            PartitionType::Block => "BLOCK",
            PartitionType::FsData => "FS-DATA",
        }
    }
}

/// The deterministic label of the given partition of the given OSD.
pub fn partition_label(id: u32, kind: PartitionType) -> String {
    format!("{}{}-{}", crate::sys::OSD_PARTITION_LABEL_PREFIX, id, kind.label_suffix())
}

/// Store sizing taken from the runtime config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_type: StoreType,
    pub wal_size_mb: u64,
    pub db_size_mb: u64,
    pub journal_size_mb: u64,
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            store_type: config.store_type,
            wal_size_mb: config.wal_size_mb,
            db_size_mb: config.db_size_mb,
            journal_size_mb: config.journal_size_mb,
        }
    }

    fn wal_size(&self) -> u64 {
        if self.wal_size_mb > 0 {
            self.wal_size_mb
        } else {
            WAL_DEFAULT_SIZE_MB
        }
    }

    fn db_size(&self) -> u64 {
        if self.db_size_mb > 0 {
            self.db_size_mb
        } else {
            DB_DEFAULT_SIZE_MB
        }
    }

    pub fn journal_size(&self) -> u64 {
        if self.journal_size_mb > 0 {
            self.journal_size_mb
        } else {
            JOURNAL_DEFAULT_SIZE_MB
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            wal_size_mb: WAL_DEFAULT_SIZE_MB,
            db_size_mb: DB_DEFAULT_SIZE_MB,
            journal_size_mb: JOURNAL_DEFAULT_SIZE_MB,
        }
    }
}

/// The placement of a single OSD partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDetails {
    /// The current kernel name of the device holding the partition.
    pub device: String,
    pub disk_uuid: String,
    pub partition_uuid: String,
    /// The size of the partition, `None` to consume the rest of the device.
    pub size_mb: Option<u64>,
    pub offset_mb: u64,
}

/// An OSD along with all of its partitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeEntry {
    pub id: u32,
    pub osd_uuid: Uuid,
    pub store_type: StoreType,
    pub partitions: BTreeMap<PartitionType, PartitionDetails>,
}

/// A dedicated device holding WAL and DB partitions for many OSDs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDeviceInfo {
    pub device: String,
    pub disk_uuid: String,
    pub partitions: Vec<MetadataPartition>,
}

/// A partition on the metadata device, along with the OSD it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPartition {
    pub id: u32,
    pub osd_uuid: Uuid,
    pub kind: PartitionType,
    pub partition_uuid: String,
    pub size_mb: u64,
    pub offset_mb: u64,
}

/// The full partition scheme of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfScheme {
    pub metadata: Option<MetadataDeviceInfo>,
    pub entries: Vec<SchemeEntry>,
}

impl SchemeEntry {
    pub fn new(id: u32, osd_uuid: Uuid, store_type: StoreType) -> Self {
        Self {
            id,
            osd_uuid,
            store_type,
            partitions: BTreeMap::new(),
        }
    }

    /// Lay out every partition of this OSD on the given device.
    pub fn populate_collocated(&mut self, device: &str, store: &StoreConfig) {
        let disk_uuid = new_uuid();
        let details = |size_mb: Option<u64>, offset_mb: u64| PartitionDetails {
            device: device.to_string(),
            disk_uuid: disk_uuid.clone(),
            partition_uuid: new_uuid(),
            size_mb,
            offset_mb,
        };

        if self.store_type == StoreType::Filestore {
            self.partitions.insert(PartitionType::FsData, details(None, FIRST_OFFSET_MB));
            return;
        }

        let (wal, db) = (store.wal_size(), store.db_size());
        let mut offset = FIRST_OFFSET_MB;
        self.partitions.insert(PartitionType::Wal, details(Some(wal), offset));
        offset += wal;
        self.partitions.insert(PartitionType::Db, details(Some(db), offset));
        offset += db;
        self.partitions.insert(PartitionType::Block, details(None, offset));
    }

    /// Lay out the block partition of this OSD on the given device, and its WAL and DB on the
    /// given metadata device after any partitions already planned there.
    pub fn populate_distributed(&mut self, device: &str, metadata: &mut MetadataDeviceInfo, store: &StoreConfig) -> Result<()> {
        if self.store_type == StoreType::Filestore {
            bail!("filestore is not supported with a dedicated metadata device");
        }

        self.partitions.insert(
            PartitionType::Block,
            PartitionDetails {
                device: device.to_string(),
                disk_uuid: new_uuid(),
                partition_uuid: new_uuid(),
                size_mb: None,
                offset_mb: FIRST_OFFSET_MB,
            },
        );

        let mut offset = match metadata.partitions.last() {
            Some(last) => last.offset_mb + last.size_mb,
            None => {
                metadata.disk_uuid = new_uuid();
                FIRST_OFFSET_MB
            }
        };
        for (kind, size_mb) in [(PartitionType::Wal, store.wal_size()), (PartitionType::Db, store.db_size())] {
            let partition_uuid = new_uuid();
            self.partitions.insert(
                kind,
                PartitionDetails {
                    device: metadata.device.clone(),
                    disk_uuid: metadata.disk_uuid.clone(),
                    partition_uuid: partition_uuid.clone(),
                    size_mb: Some(size_mb),
                    offset_mb: offset,
                },
            );
            metadata.partitions.push(MetadataPartition {
                id: self.id,
                osd_uuid: self.osd_uuid,
                kind,
                partition_uuid,
                size_mb,
                offset_mb: offset,
            });
            offset += size_mb;
        }
        Ok(())
    }

    /// Check if every partition of this OSD lives on one disk.
    pub fn is_collocated(&self) -> bool {
        let mut disks = self.partitions.values().map(|part| part.disk_uuid.as_str());
        match disks.next() {
            Some(first) => disks.all(|disk| disk == first),
            None => true,
        }
    }

    /// The partition holding this OSD's data.
    pub fn data_partition_type(&self) -> PartitionType {
        match self.store_type {
            StoreType::Filestore => PartitionType::FsData,
            StoreType::Bluestore => PartitionType::Block,
        }
    }

    pub fn data_details(&self) -> Result<&PartitionDetails> {
        self.partitions
            .get(&self.data_partition_type())
            .with_context(|| format!("data partition missing from scheme of osd {}", self.id))
    }

    /// The partition holding this OSD's metadata. Filestore keeps its metadata with its data.
    pub fn metadata_details(&self) -> Result<&PartitionDetails> {
        if self.store_type == StoreType::Filestore {
            return self.data_details();
        }
        self.partitions
            .get(&PartitionType::Db)
            .with_context(|| format!("metadata partition missing from scheme of osd {}", self.id))
    }

    /// The `sgdisk` arguments which create this OSD's partitions on its data device.
    pub fn partition_args(&self) -> Result<Vec<String>> {
        let mut args = vec![];
        let mut number = 1;
        if self.store_type == StoreType::Bluestore && self.is_collocated() {
            for kind in [PartitionType::Wal, PartitionType::Db] {
                let details = self
                    .partitions
                    .get(&kind)
                    .with_context(|| format!("{:?} partition missing from scheme of osd {}", kind, self.id))?;
                args.extend(partition_args(number, &details.partition_uuid, details.offset_mb, details.size_mb, &partition_label(self.id, kind)));
                number += 1;
            }
        }
        let data = self.data_details()?;
        args.extend(partition_args(number, &data.partition_uuid, data.offset_mb, data.size_mb, &partition_label(self.id, self.data_partition_type())));
        args.push(format!("--disk-guid={}", data.disk_uuid));
        args.push(crate::sys::dev_path(&data.device));
        Ok(args)
    }
}

impl MetadataDeviceInfo {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            disk_uuid: String::new(),
            partitions: vec![],
        }
    }

    /// The `sgdisk` arguments which create the metadata partitions numbered after the first
    /// `skip`, which are expected to exist already.
    pub fn partition_args(&self, skip: usize) -> Vec<String> {
        let mut args: Vec<String> = self
            .partitions
            .iter()
            .enumerate()
            .skip(skip)
            .flat_map(|(idx, part)| {
                partition_args(idx as u32 + 1, &part.partition_uuid, part.offset_mb, Some(part.size_mb), &partition_label(part.id, part.kind))
            })
            .collect();
        args.push(format!("--disk-guid={}", self.disk_uuid));
        args.push(crate::sys::dev_path(&self.device));
        args
    }

    /// The comma separated ids of the OSDs with metadata on this device.
    pub fn osd_ids(&self) -> String {
        let mut ids: Vec<u32> = self.partitions.iter().map(|part| part.id).collect();
        ids.dedup();
        ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
    }
}

impl PerfScheme {
    pub fn entry(&self, id: u32) -> Option<&SchemeEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Check if any committed partition lives on the given disk.
    pub fn uses_disk(&self, disk_uuid: &str) -> bool {
        !disk_uuid.is_empty()
            && (self.entries.iter().any(|entry| entry.partitions.values().any(|part| part.disk_uuid == disk_uuid))
                || self.metadata.as_ref().map(|meta| meta.disk_uuid == disk_uuid).unwrap_or(false))
    }

    /// Record the current name of the disk with the given UUID everywhere it appears, returning
    /// `true` if anything changed.
    pub fn refresh_device_name(&mut self, disk_uuid: &str, name: &str) -> bool {
        if disk_uuid.is_empty() {
            return false;
        }
        let mut changed = false;
        for part in self.entries.iter_mut().flat_map(|entry| entry.partitions.values_mut()) {
            if part.disk_uuid == disk_uuid && part.device != name {
                part.device = name.to_string();
                changed = true;
            }
        }
        if let Some(meta) = self.metadata.as_mut() {
            if meta.disk_uuid == disk_uuid && meta.device != name {
                meta.device = name.to_string();
                changed = true;
            }
        }
        changed
    }
}

/// The `sgdisk` arguments for one partition. Sizes and offsets are in MiB; a size of `None`
/// assigns the largest free block of the device.
fn partition_args(number: u32, guid: &str, offset_mb: u64, size_mb: Option<u64>, label: &str) -> Vec<String> {
    let new_part = match size_mb {
        None => format!("--largest-new={}", number),
        Some(size) => format!("--new={}:{}:+{}", number, offset_mb * SECTORS_PER_MB, size * SECTORS_PER_MB),
    };
    vec![new_part, format!("--change-name={}:{}", number, label), format!("--partition-guid={}:{}", number, guid)]
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// The durable home of a node's partition scheme.
#[derive(Clone)]
pub struct SchemeStore {
    tree: Tree,
}

impl SchemeStore {
    pub async fn open(db: &Database) -> Result<Self> {
        let tree = db.scheme_tree().await?;
        Ok(Self { tree })
    }

    /// Load the committed scheme, empty if none was ever saved.
    pub async fn load(&self) -> Result<PerfScheme> {
        let tree = self.tree.clone();
        let raw = Database::spawn_blocking(move || tree.get(KEY_SCHEME))
            .await?
            .context("error reading partition scheme")?;
        match raw {
            None => Ok(PerfScheme::default()),
            Some(raw) => serde_json::from_slice(&raw).context("error decoding partition scheme"),
        }
    }

    /// Commit the given scheme.
    pub async fn save(&self, scheme: &PerfScheme) -> Result<()> {
        let doc = serde_json::to_vec(scheme).context("error encoding partition scheme")?;
        let tree = self.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(KEY_SCHEME, doc)?;
            tree.flush()?;
            Ok(())
        })
        .await?
        .context("error writing partition scheme")
    }
}
