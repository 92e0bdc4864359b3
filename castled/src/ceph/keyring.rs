//! Keyring generation and on-disk keyring files.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::RngCore;

use crate::ceph::client::CephClient;

pub const ADMIN_USERNAME: &str = "client.admin";
pub const BOOTSTRAP_OSD_USERNAME: &str = "client.bootstrap-osd";
pub const RGW_USERNAME: &str = "client.radosgw.gateway";

const KEY_TYPE_AES: u16 = 1;
const KEY_SECRET_LEN: u16 = 16;
const KEYRING_DIR_MODE: u32 = 0o744;
const KEYRING_FILE_MODE: u32 = 0o644;

const ADMIN_CAPS: &str = "\tauid = 0\n\tcaps mds = \"allow\"\n\tcaps mon = \"allow *\"\n\tcaps osd = \"allow *\"\n";

pub fn admin_keyring(admin_secret: &str) -> String {
    format!("[{}]\n\tkey = {}\n{}", ADMIN_USERNAME, admin_secret, ADMIN_CAPS)
}

/// The keyring of a monitor, which also carries the admin identity.
pub fn monitor_keyring(monitor_secret: &str, admin_secret: &str) -> String {
    format!("[mon.]\n\tkey = {}\n\tcaps mon = \"allow *\"\n{}", monitor_secret, admin_keyring(admin_secret))
}

pub fn bootstrap_osd_keyring(key: &str) -> String {
    format!("[{}]\n\tkey = {}\n\tcaps mon = \"allow profile bootstrap-osd\"\n", BOOTSTRAP_OSD_USERNAME, key)
}

pub fn mds_keyring(id: &str, key: &str) -> String {
    format!("[mds.{}]\n\tkey = {}\n", id, key)
}

pub fn rgw_keyring(key: &str) -> String {
    format!("[{}]\n\tkey = {}\n", RGW_USERNAME, key)
}

/// Generate a new secret in the form the storage daemons expect: a little-endian header of
/// key type, creation time and secret length, followed by the random secret, base64 encoded.
pub fn generate_key() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut secret = [0u8; KEY_SECRET_LEN as usize];
    rand::thread_rng().fill_bytes(&mut secret);

    let mut buf = Vec::with_capacity(12 + secret.len());
    buf.extend_from_slice(&KEY_TYPE_AES.to_le_bytes());
    buf.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
    buf.extend_from_slice(&now.subsec_nanos().to_le_bytes());
    buf.extend_from_slice(&KEY_SECRET_LEN.to_le_bytes());
    buf.extend_from_slice(&secret);
    base64::encode(buf)
}

/// Write a keyring file, creating its parent directories as needed.
pub async fn write_keyring(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(KEYRING_DIR_MODE)
            .create(parent)
            .await
            .with_context(|| format!("error creating keyring directory for {}", path.display()))?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("error writing keyring to {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(KEYRING_FILE_MODE))
        .await
        .with_context(|| format!("error setting permissions of keyring {}", path.display()))?;
    Ok(())
}

/// Ensure a keyring for `entity` exists at `path`, asking the cluster for the entity's key
/// only when the file is missing.
pub async fn create_keyring<F>(client: &CephClient, path: &Path, entity: &str, caps: &[&str], render: F) -> Result<()>
where
    F: FnOnce(&str) -> String,
{
    if tokio::fs::metadata(path).await.is_ok() {
        tracing::debug!(entity, path = %path.display(), "keyring already exists");
        return Ok(());
    }
    let key = client
        .auth_get_or_create_key(entity, caps)
        .await
        .with_context(|| format!("error fetching key of {}", entity))?;
    write_keyring(path, &render(&key)).await
}
