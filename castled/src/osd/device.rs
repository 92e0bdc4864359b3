//! Claiming, partitioning and formatting of OSD devices.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::scheme::{MetadataDeviceInfo, PartitionType, SchemeEntry, StoreType};
use crate::exec::Executor;
use crate::sys;
use castle_core::AppError;

/// Attempts made while waiting for a partition path to appear.
const PATH_WAIT_RETRIES: u32 = 25;
const PATH_WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// The links placed in a bluestore OSD's data dir, by partition.
const BLUESTORE_LINKS: [(PartitionType, &str); 3] = [
    (PartitionType::Block, "block"),
    (PartitionType::Wal, "block.wal"),
    (PartitionType::Db, "block.db"),
];

/// Check that the given device holds nothing foreign.
///
/// A device is available when it has no filesystem and every partition on it, if any, was
/// created for an OSD. With `force_format` a foreign device is only warned about.
pub async fn check_available(executor: &dyn Executor, name: &str, force_format: bool) -> Result<()> {
    let (partitions, _) = sys::device_partitions(executor, name)
        .await
        .with_context(|| format!("error reading partitions of {}", name))?;
    let foreign: Vec<&str> = partitions
        .iter()
        .filter(|part| !part.label.starts_with(sys::OSD_PARTITION_LABEL_PREFIX))
        .map(|part| part.name.as_str())
        .collect();
    let filesystem = sys::device_filesystem(executor, name)
        .await
        .with_context(|| format!("error reading filesystem of {}", name))?;

    let reason = match (filesystem.is_empty(), foreign.is_empty()) {
        (true, true) => return Ok(()),
        (false, _) => format!("already formatted with {}", filesystem),
        (true, false) => format!("has foreign partitions {:?}", foreign),
    };
    if force_format {
        tracing::warn!(device = name, reason = %reason, "device will be formatted anyway");
        return Ok(());
    }
    Err(AppError::PartitionHazard {
        device: name.to_string(),
        reason,
    }
    .into())
}

/// Check if the given error, or anything in its chain, is a partition hazard.
pub fn is_hazard(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::PartitionHazard { .. })))
}

/// Run `f`, and once more after `delay` if it fails.
async fn retry_once<F, Fut, T>(delay: Duration, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Ok(val),
        Err(err) => {
            tracing::warn!(error = ?err, delay = ?delay, "first attempt to {} failed, retrying", what);
            tokio::time::sleep(delay).await;
            f().await
        }
    }
}

/// Wait for the given path to show up on the host.
pub async fn wait_for_path(executor: &dyn Executor, path: &str) -> Result<()> {
    for attempt in 0..=PATH_WAIT_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(PATH_WAIT_INTERVAL).await;
        }
        match executor.stat(Path::new(path)).await {
            Ok(true) => return Ok(()),
            Ok(false) => (),
            Err(err) => tracing::debug!(error = ?err, path, "error checking path"),
        }
    }
    bail!("{} did not appear after {} attempts", path, PATH_WAIT_RETRIES + 1)
}

/// Wipe the data device of the given OSD and create its partitions. Filestore data partitions
/// get a filesystem which is mounted at `root`.
pub async fn partition_osd(executor: &dyn Executor, entry: &SchemeEntry, root: &Path, retry_delay: Duration) -> Result<()> {
    let data = entry.data_details()?;
    let args = entry.partition_args()?;
    let (device, args) = (data.device.as_str(), args.as_slice());
    tracing::info!(osd = entry.id, device, "partitioning device");
    retry_once(retry_delay, "partition the device", move || async move {
        sys::remove_partitions(executor, device).await?;
        sys::create_partitions(executor, device, args).await
    })
    .await
    .with_context(|| format!("error partitioning device {} of osd {}", data.device, entry.id))?;

    if entry.store_type == StoreType::Filestore {
        let part_path = sys::partuuid_path(&data.partition_uuid);
        let part_path = part_path.as_str();
        wait_for_path(executor, part_path).await?;
        retry_once(retry_delay, "format the data partition", move || sys::format_device(executor, part_path))
            .await
            .with_context(|| format!("error formatting data partition of osd {}", entry.id))?;
        sys::mount_device(executor, part_path, root).await?;
    }
    Ok(())
}

/// Mount the filestore data partition of the given OSD at `root` unless something already is.
pub async fn ensure_mounted(executor: &dyn Executor, entry: &SchemeEntry, root: &Path) -> Result<()> {
    if entry.store_type != StoreType::Filestore || sys::is_mounted(executor, root).await {
        return Ok(());
    }
    let part_path = sys::partuuid_path(&entry.data_details()?.partition_uuid);
    wait_for_path(executor, &part_path).await?;
    sys::mount_device(executor, &part_path, root).await
}

/// Create the partitions of `planned` which `committed` lacks on the metadata device,
/// returning `true` if anything was created.
///
/// A metadata device is zapped only the first time it is used; afterwards new partitions are
/// appended behind the existing ones.
pub async fn partition_metadata(
    executor: &dyn Executor, planned: &MetadataDeviceInfo, committed: Option<&MetadataDeviceInfo>, retry_delay: Duration,
) -> Result<bool> {
    let existing = match committed {
        Some(committed) if !committed.partitions.is_empty() => {
            if committed.disk_uuid != planned.disk_uuid {
                bail!(
                    "metadata partitions already exist on {} ({}), cannot use {} ({})",
                    committed.device,
                    committed.disk_uuid,
                    planned.device,
                    planned.disk_uuid
                );
            }
            committed.partitions.len()
        }
        _ => 0,
    };
    if planned.partitions.len() <= existing {
        return Ok(false);
    }

    tracing::info!(device = %planned.device, existing, total = planned.partitions.len(), "partitioning metadata device");
    let args = planned.partition_args(existing);
    let (device, args) = (planned.device.as_str(), args.as_slice());
    retry_once(retry_delay, "partition the metadata device", move || async move {
        if existing == 0 {
            sys::remove_partitions(executor, device).await?;
        }
        sys::create_partitions(executor, device, args).await
    })
    .await
    .with_context(|| format!("error partitioning metadata device {}", planned.device))?;
    Ok(true)
}

/// Link the bluestore partitions of the given OSD into its data dir by partition uuid.
pub async fn link_partitions(entry: &SchemeEntry, root: &Path) -> Result<()> {
    if entry.store_type != StoreType::Bluestore {
        return Ok(());
    }
    for (kind, link) in BLUESTORE_LINKS {
        let part = match entry.partitions.get(&kind) {
            Some(part) => part,
            None => continue,
        };
        let link = root.join(link);
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            tokio::fs::remove_file(&link)
                .await
                .with_context(|| format!("error removing stale link {}", link.display()))?;
        }
        tokio::fs::symlink(sys::partuuid_path(&part.partition_uuid), &link)
            .await
            .with_context(|| format!("error linking {}", link.display()))?;
    }
    Ok(())
}
