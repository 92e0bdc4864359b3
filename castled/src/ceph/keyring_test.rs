use std::os::unix::fs::PermissionsExt;

use anyhow::Result;

use super::keyring::*;

#[test]
fn generate_key_has_expected_layout() -> Result<()> {
    let key = generate_key();
    let raw = base64::decode(&key)?;

    assert!(raw.len() == 28, "unexpected decoded key length, got {}, expected {}", raw.len(), 28);
    let key_type = u16::from_le_bytes([raw[0], raw[1]]);
    assert!(key_type == 1, "unexpected key type, got {}, expected {}", key_type, 1);
    let secret_len = u16::from_le_bytes([raw[10], raw[11]]);
    assert!(secret_len == 16, "unexpected secret length, got {}, expected {}", secret_len, 16);
    assert!(generate_key() != key, "expected two generated keys to differ");
    Ok(())
}

#[test]
fn monitor_keyring_carries_both_identities() {
    let keyring = monitor_keyring("monkey", "adminkey");
    assert!(keyring.starts_with("[mon.]\n\tkey = monkey\n"), "unexpected monitor keyring header, got:\n{}", keyring);
    assert!(keyring.contains("[client.admin]\n\tkey = adminkey\n"), "expected admin section in monitor keyring, got:\n{}", keyring);
    assert!(keyring.contains("caps osd = \"allow *\""), "expected admin caps in monitor keyring, got:\n{}", keyring);
}

#[tokio::test]
async fn write_keyring_creates_dirs_and_sets_mode() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("nested").join("dir").join("keyring");

    write_keyring(&path, &bootstrap_osd_keyring("bootkey")).await?;

    let contents = tokio::fs::read_to_string(&path).await?;
    assert!(contents.contains("[client.bootstrap-osd]"), "unexpected keyring contents, got:\n{}", contents);
    let mode = tokio::fs::metadata(&path).await?.permissions().mode() & 0o777;
    assert!(mode == 0o644, "unexpected keyring mode, got {:o}, expected {:o}", mode, 0o644);
    Ok(())
}
