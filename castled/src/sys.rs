//! Host block device primitives.
//!
//! Device facts come from `lsblk` and the udev database. Partitioning is done with `sgdisk`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::exec::{args, Executor};
use castle_core::inventory::{Disk, DISK_TYPE_DISK, DISK_TYPE_PART};

/// The directory of stable partition paths.
pub const DISK_BY_PARTUUID: &str = "/dev/disk/by-partuuid";
/// Every partition this system creates carries a label with this prefix.
pub const OSD_PARTITION_LABEL_PREFIX: &str = "ROOK-OSD";

const UDEV_PART_TABLE_UUID: &str = "ID_PART_TABLE_UUID";
const UDEV_PART_ENTRY_NAME: &str = "ID_PART_ENTRY_NAME";
const UDEV_FS_TYPE: &str = "ID_FS_TYPE";

/// A partition found on a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub label: String,
    pub size: u64,
}

/// Parse one line of `lsblk --pairs` output, e.g. `NAME="sda" SIZE="1024"`.
pub fn parse_pairs(line: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 2..];
        let end = match after.find('"') {
            Some(end) => end,
            None => break,
        };
        out.insert(key, after[..end].to_string());
        rest = &after[end + 1..];
    }
    out
}

/// Parse `udevadm info --query=property` output, one `KEY=VALUE` per line.
pub fn parse_properties(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, val)| (key.trim().to_string(), val.trim().to_string()))
        .collect()
}

async fn list_block_devices(executor: &dyn Executor, device: Option<&str>) -> Result<Vec<HashMap<String, String>>> {
    let mut cmd = args(["--noheadings", "--bytes", "--pairs", "--output", "NAME,SIZE,TYPE,PKNAME"]);
    match device {
        Some(device) => cmd.insert(0, dev_path(device)),
        None => cmd.insert(0, "--all".into()),
    }
    let output = executor.execute("lsblk", &cmd).await.context("error listing block devices")?;
    Ok(output.lines().filter(|line| !line.trim().is_empty()).map(parse_pairs).collect())
}

/// The udev properties of the given device.
pub async fn device_properties(executor: &dyn Executor, name: &str) -> Result<HashMap<String, String>> {
    let output = executor
        .execute("udevadm", &args(["info", "--query=property", dev_path(name).as_str()]))
        .await
        .with_context(|| format!("error querying udev properties of {}", name))?;
    Ok(parse_properties(&output))
}

/// Discover the block devices of this host. Whole disks carry their partition table GUID.
pub async fn discover_devices(executor: &dyn Executor) -> Result<Vec<Disk>> {
    let mut disks = vec![];
    for dev in list_block_devices(executor, None).await? {
        let name = dev.get("NAME").cloned().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let disk_type = dev.get("TYPE").cloned().unwrap_or_default();
        let mut disk = Disk {
            size: dev.get("SIZE").and_then(|size| size.parse().ok()).unwrap_or_default(),
            parent: dev.get("PKNAME").cloned().unwrap_or_default(),
            name,
            disk_type,
            uuid: String::new(),
        };
        if disk.disk_type == DISK_TYPE_DISK {
            match device_properties(executor, &disk.name).await {
                Ok(props) => disk.uuid = props.get(UDEV_PART_TABLE_UUID).cloned().unwrap_or_default(),
                Err(err) => tracing::warn!(error = ?err, device = %disk.name, "failed to read device uuid"),
            }
        }
        disks.push(disk);
    }
    Ok(disks)
}

/// Whole disks which may be claimed for OSDs; partitions are never candidates.
pub fn candidate_disks(disks: &[Disk]) -> impl Iterator<Item = &Disk> {
    disks.iter().filter(|disk| disk.disk_type == DISK_TYPE_DISK)
}

/// The filesystem on the given device, empty if there is none.
pub async fn device_filesystem(executor: &dyn Executor, name: &str) -> Result<String> {
    let props = device_properties(executor, name).await?;
    Ok(props.get(UDEV_FS_TYPE).cloned().unwrap_or_default())
}

/// The partitions of the given device along with the total bytes they use.
pub async fn device_partitions(executor: &dyn Executor, name: &str) -> Result<(Vec<Partition>, u64)> {
    let mut partitions = vec![];
    let mut used = 0;
    for dev in list_block_devices(executor, Some(name)).await? {
        if dev.get("TYPE").map(String::as_str) != Some(DISK_TYPE_PART) || dev.get("PKNAME").map(String::as_str) != Some(name) {
            continue;
        }
        let part_name = dev.get("NAME").cloned().unwrap_or_default();
        let size: u64 = dev.get("SIZE").and_then(|size| size.parse().ok()).unwrap_or_default();
        let props = device_properties(executor, &part_name).await?;
        used += size;
        partitions.push(Partition {
            label: props.get(UDEV_PART_ENTRY_NAME).cloned().unwrap_or_default(),
            name: part_name,
            size,
        });
    }
    Ok((partitions, used))
}

/// The size in bytes of the block device at the given path.
pub async fn device_size(executor: &dyn Executor, path: &str) -> Result<u64> {
    let output = executor
        .execute("lsblk", &args([path, "--bytes", "--nodeps", "--noheadings", "--output", "SIZE"]))
        .await
        .with_context(|| format!("error reading size of {}", path))?;
    output
        .trim()
        .parse()
        .with_context(|| format!("unexpected size output for {}: {:?}", path, output))
}

/// Wipe the partition table of the given device.
pub async fn remove_partitions(executor: &dyn Executor, name: &str) -> Result<()> {
    executor
        .execute("sgdisk", &args(["--zap-all", dev_path(name).as_str()]))
        .await
        .with_context(|| format!("error zapping partitions on {}", dev_path(name)))?;
    Ok(())
}

/// Create partitions with the given `sgdisk` arguments.
pub async fn create_partitions(executor: &dyn Executor, name: &str, sgdisk_args: &[String]) -> Result<()> {
    executor
        .execute("sgdisk", sgdisk_args)
        .await
        .with_context(|| format!("error partitioning {}", dev_path(name)))?;
    Ok(())
}

/// Create an ext4 filesystem on the given device path.
pub async fn format_device(executor: &dyn Executor, path: &str) -> Result<()> {
    executor
        .execute("mkfs.ext4", &args([path]))
        .await
        .with_context(|| format!("error formatting {}", path))?;
    Ok(())
}

/// Mount the given device path at `target`, creating the target as needed.
pub async fn mount_device(executor: &dyn Executor, path: &str, target: &Path) -> Result<()> {
    tokio::fs::create_dir_all(target)
        .await
        .with_context(|| format!("error creating mount point {}", target.display()))?;
    executor
        .execute("mount", &args([path.to_string(), target.to_string_lossy().into_owned()]))
        .await
        .with_context(|| format!("error mounting {} at {}", path, target.display()))?;
    Ok(())
}

/// Check if something is mounted at `target`.
pub async fn is_mounted(executor: &dyn Executor, target: &Path) -> bool {
    let target = target.to_string_lossy().into_owned();
    match executor
        .execute("findmnt", &args(["--noheadings", "--output", "TARGET", "--mountpoint", target.as_str()]))
        .await
    {
        Ok(output) => output.lines().any(|line| line.trim() == target),
        // findmnt exits non-zero when nothing is mounted.
        Err(_) => false,
    }
}

/// The total size in bytes of the filesystem holding `path`.
pub fn filesystem_size(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).context("path contains a nul byte")?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is a valid nul-terminated string and `stat` is a valid out pointer.
    let res = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if res != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("error reading filesystem stats of {}", path.display()));
    }
    Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
}

/// `/dev/<name>`
pub fn dev_path(name: &str) -> String {
    format!("/dev/{}", name)
}

/// `/dev/disk/by-partuuid/<uuid>`
pub fn partuuid_path(uuid: &str) -> String {
    format!("{}/{}", DISK_BY_PARTUUID, uuid)
}
