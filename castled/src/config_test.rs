use anyhow::Result;

use super::*;
use castle_core::AppError;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("LOG_LEVEL".into(), "debug".into()),
        ("NODE_ID".into(), "node-a".into()),
        ("CLUSTER_NAME".into(), "ceph".into()),
        ("PUBLIC_IP".into(), "10.0.0.1".into()),
        ("PRIVATE_IP".into(), "192.168.0.1".into()),
        ("CONFIG_ROOT".into(), "/var/lib/castle-test".into()),
        ("ADMIN_PORT".into(), "7000".into()),
        ("DEVICES".into(), "sdb,sdc".into()),
        ("METADATA_DEVICE".into(), "nvme0n1".into()),
        ("FORCE_FORMAT".into(), "true".into()),
        ("STORE_TYPE".into(), "filestore".into()),
        ("WAL_SIZE_MB".into(), "1024".into()),
        ("LOCATION".into(), "rack=r1,datacenter=dc1".into()),
        ("DAEMON_LAUNCHER".into(), "/usr/bin/castle".into()),
        ("KVS_ENDPOINTS".into(), "http://10.0.0.1:2379, http://10.0.0.2:2379".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.node_id == "node-a", "unexpected value parsed for NODE_ID, got {}, expected {}", config.node_id, "node-a");
    assert!(config.cluster_name == "ceph", "unexpected value parsed for CLUSTER_NAME, got {}, expected {}", config.cluster_name, "ceph");
    assert!(config.admin_port == 7000, "unexpected value parsed for ADMIN_PORT, got {}, expected {}", config.admin_port, 7000);
    assert!(config.force_format, "expected FORCE_FORMAT to parse as true");
    assert!(
        config.store_type == StoreType::Filestore,
        "unexpected value parsed for STORE_TYPE, got {:?}, expected {:?}",
        config.store_type,
        StoreType::Filestore
    );
    assert!(config.wal_size_mb == 1024, "unexpected value parsed for WAL_SIZE_MB, got {}, expected {}", config.wal_size_mb, 1024);
    assert!(
        config.daemon_launcher.as_deref() == Some("/usr/bin/castle"),
        "unexpected value parsed for DAEMON_LAUNCHER, got {:?}",
        config.daemon_launcher
    );
    let expected = KvsBackend::Etcd(vec!["http://10.0.0.1:2379".into(), "http://10.0.0.2:2379".into()]);
    assert!(config.kvs_backend() == expected, "unexpected kvs backend, got {:?}, expected {:?}", config.kvs_backend(), expected);
    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("NODE_ID".into(), "node-a".into()), ("PUBLIC_IP".into(), "10.0.0.1".into())])?;
    config.validate()?;

    assert!(
        config.cluster_name == DEFAULT_CLUSTER_NAME,
        "unexpected default cluster name, got {}, expected {}",
        config.cluster_name,
        DEFAULT_CLUSTER_NAME
    );
    assert!(config.config_root == DEFAULT_CONFIG_ROOT, "unexpected default config root, got {}", config.config_root);
    assert!(config.store_type == StoreType::Bluestore, "unexpected default store type, got {:?}", config.store_type);
    assert!(config.wal_size_mb == 576, "unexpected default wal size, got {}", config.wal_size_mb);
    assert!(config.db_size_mb == 20480, "unexpected default db size, got {}", config.db_size_mb);
    assert!(config.quorum_retries == 20, "unexpected default quorum retries, got {}", config.quorum_retries);
    assert!(config.daemon_launcher.is_none(), "expected no daemon launcher by default");
    assert!(config.kvs_backend() == KvsBackend::NodeLocal, "expected a node-local store by default, got {:?}", config.kvs_backend());
    Ok(())
}

#[test]
fn config_validation_rejects_bad_input() -> Result<()> {
    let cases = vec![
        ("STORE_TYPE", "zfs"),
        ("LOG_LEVEL", "loud"),
        ("LOCATION", "rack"),
        ("LEASE_DURATION_SECS", "5"),
    ];
    for (key, val) in cases {
        let res: Result<Config, _> = envy::from_iter(vec![
            ("NODE_ID".into(), "node-a".into()),
            ("PUBLIC_IP".into(), "10.0.0.1".into()),
            (key.to_string(), val.to_string()),
        ]);
        let config = match res {
            // Unknown enum variants are rejected during deserialization.
            Err(_) => continue,
            Ok(config) => config,
        };
        let err = match config.validate() {
            Ok(_) => anyhow::bail!("expected {}={} to fail validation", key, val),
            Err(err) => err,
        };
        assert!(AppError::is_config_invalid(&err), "expected a config error for {}={}, got {:?}", key, val, err);
    }
    Ok(())
}

#[test]
fn split_list_accepts_commas_and_whitespace() {
    let items = split_list("/a, /b  /c,,");
    assert!(items == vec!["/a", "/b", "/c"], "unexpected items, got {:?}", items);
}
