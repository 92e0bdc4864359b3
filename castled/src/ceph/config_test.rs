use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use super::cluster::{ClusterInfo, MonitorConfig};
use super::config::*;
use crate::config::Config;
use crate::osd::scheme::StoreType;

fn test_cluster() -> ClusterInfo {
    let mut monitors = BTreeMap::new();
    monitors.insert("a".to_string(), MonitorConfig { name: "mon0".into(), endpoint: "1.2.3.4:6790".into() });
    monitors.insert("b".to_string(), MonitorConfig { name: "mon1".into(), endpoint: "1.2.3.5:6790".into() });
    ClusterInfo {
        fsid: "f1d".into(),
        name: "castle".into(),
        monitor_secret: "monsecret".into(),
        admin_secret: "adminsecret".into(),
        monitors,
    }
}

#[test]
fn qualified_user_prefixes_bare_names() {
    assert!(qualified_user("admin") == "client.admin", "unexpected user, got {}, expected client.admin", qualified_user("admin"));
    assert!(qualified_user("mds.1") == "mds.1", "unexpected user, got {}, expected mds.1", qualified_user("mds.1"));
}

#[test]
fn debug_level_maps_log_levels() {
    for (level, expected) in [("warn", -1), ("info", 0), ("debug", 10), ("trace", 100)] {
        let got = debug_level(level);
        assert!(got == expected, "unexpected debug level for {}, got {}, expected {}", level, got, expected);
    }
}

#[test]
fn default_config_carries_cluster_globals() -> Result<()> {
    let (config, _tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let cluster = test_cluster();

    let file = default_config(&config, &cluster, Path::new("/run/castle"), StoreType::Bluestore);

    let checks = [
        ("fsid", "f1d"),
        ("run dir", "/run/castle"),
        ("mon initial members", "mon0 mon1"),
        ("public addr", "1.2.3.4"),
        ("cluster addr", "1.2.3.4"),
        ("osd objectstore", "bluestore"),
        ("enable experimental unrecoverable data corrupting features", "bluestore rocksdb"),
        ("debug osd", "0"),
        ("osd pool default pg num", "100"),
    ];
    for (key, expected) in checks {
        let got = file.get("global", key);
        assert!(got == Some(expected), "unexpected value for {}, got {:?}, expected {}", key, got, expected);
    }
    assert!(file.get("global", "osd max object name len").is_none(), "expected no filestore settings for bluestore");
    Ok(())
}

#[test]
fn default_config_filestore_omits_experimental() -> Result<()> {
    let (config, _tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let file = default_config(&config, &test_cluster(), Path::new("/run"), StoreType::Filestore);

    assert!(
        file.get("global", "enable experimental unrecoverable data corrupting features").is_none(),
        "expected experimental features to be omitted for filestore"
    );
    let name_len = file.get("global", "osd max object name len");
    assert!(name_len == Some("256"), "unexpected osd max object name len, got {:?}, expected 256", name_len);
    Ok(())
}

#[tokio::test]
async fn generate_config_file_writes_all_sections() -> Result<()> {
    let (config, tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let root = tmpdir.path().join("mon0");
    let keyring = root.join("keyring");

    let path = generate_config_file(
        &config,
        &test_cluster(),
        ConfigOptions {
            root: &root,
            user: "mon.mon0",
            keyring: &keyring,
            store_type: StoreType::Bluestore,
            global: vec![("osd journal size".into(), "1024".into())],
            client: vec![("rgw port".into(), "53390".into())],
        },
    )
    .await?;

    let expected_path = root.join("castle.config");
    assert!(path == expected_path, "unexpected config path, got {}, expected {}", path.display(), expected_path.display());
    let contents = tokio::fs::read_to_string(&path).await?;
    for needle in ["[global]", "osd journal size", "fsid"] {
        assert!(contents.contains(needle), "expected config file to contain {:?}, got:\n{}", needle, contents);
    }
    // The daemon's own section is shared with its monitor entry, the remaining monitors follow.
    let line = |key: &str, val: &str| format!("{:<40} = {}\n", key, val);
    let expected_tail = [
        "[mon.mon0]\n".to_string(),
        line("keyring", &keyring.display().to_string()),
        line("rgw port", "53390"),
        line("name", "mon0"),
        line("mon addr", "1.2.3.4:6790"),
        "\n[mon.mon1]\n".to_string(),
        line("name", "mon1"),
        line("mon addr", "1.2.3.5:6790"),
        "\n".to_string(),
    ]
    .concat();
    assert!(contents.ends_with(&expected_tail), "unexpected client and monitor sections, got:\n{}\nexpected tail:\n{}", contents, expected_tail);
    Ok(())
}

#[test]
fn section_set_replaces_existing_keys() {
    let mut file = ConfigFile::default();
    file.section("global").set("fsid", "one").set("fsid", "two");
    let got = file.get("global", "fsid");
    assert!(got == Some("two"), "unexpected fsid, got {:?}, expected two", got);
    assert!(file.sections[0].entries.len() == 1, "expected a single entry, got {}", file.sections[0].entries.len());
}
