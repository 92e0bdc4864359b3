use anyhow::Result;

use super::*;
use crate::fixtures::{self, TestCluster};
use castle_core::kvs::MemKvs;

#[tokio::test]
async fn object_store_switch() -> Result<()> {
    let kvs = MemKvs::new();
    assert!(!object_store_enabled(&kvs, "castle", false).await?, "expected the object store to start disabled");

    enable_object_store(&kvs, "castle").await?;
    assert!(object_store_enabled(&kvs, "castle", false).await?, "expected the object store to be requested");
    set_gateway(&kvs, "castle", "a", false).await?;

    remove_object_store(&kvs, "castle").await?;
    assert!(!object_store_enabled(&kvs, "castle", false).await?, "expected the request to be withdrawn");
    let gateways = load_gateways(&kvs, "castle", false).await?;
    assert!(gateways.is_empty(), "unexpected desired gateways {:?}", gateways);
    Ok(())
}

#[tokio::test]
async fn enable_and_remove_object_store() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.add_node("b", "1.2.3.5").await?;
    cluster.refresh("a").await?;
    let kvs = cluster.kvs.as_ref();

    enable_object_store(kvs, "castle").await?;
    cluster.refresh("a").await?;

    let keyring = load_keyring(kvs, "castle").await?.unwrap_or_default();
    assert!(keyring.contains(fixtures::TEST_KEY), "unexpected gateway keyring {:?}", keyring);
    assert!(object_store_enabled(kvs, "castle", true).await?, "expected the object store to be applied");
    let applied = load_gateways(kvs, "castle", true).await?;
    assert!(applied == ["a", "b"], "unexpected applied gateways, got {:?}, expected a and b", applied);
    for node in ["a", "b"] {
        let node = cluster.node(node)?;
        assert!(node.supervisor.is_running(RGW_BINARY, "--name=client.radosgw.gateway"), "expected a gateway on every node");
        let conf = tokio::fs::read_to_string(node.config_root().join("rgw").join("castle.config")).await?;
        assert!(conf.contains("civetweb port=53390"), "expected the gateway frontend in its config, got {}", conf);
    }

    // Enabling again must neither regenerate the key nor start a second gateway.
    cluster.refresh("a").await?;
    let keys = cluster.executor.matching("^ceph auth get-or-create-key client.radosgw.gateway");
    assert!(keys.len() == 1, "unexpected key requests, got {:?}", keys);
    let starts: Vec<_> = cluster.node("a")?.supervisor.starts().into_iter().filter(|proc| proc.binary == RGW_BINARY).collect();
    assert!(starts.len() == 1, "unexpected gateway starts, got {}, expected 1", starts.len());

    remove_object_store(kvs, "castle").await?;
    cluster.refresh("a").await?;

    assert!(!object_store_enabled(kvs, "castle", true).await?, "expected the object store to be unapplied");
    let applied = load_gateways(kvs, "castle", true).await?;
    assert!(applied.is_empty(), "unexpected applied gateways {:?}", applied);
    for node in ["a", "b"] {
        let node = cluster.node(node)?;
        assert!(!node.supervisor.is_running(RGW_BINARY, "--name"), "expected every gateway to be stopped");
    }
    cluster.shutdown().await
}

#[tokio::test]
async fn gateway_without_keyring_fails() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.refresh("a").await?;

    let ctx = cluster.node("a")?.context().await?;
    let res = crate::service::ServiceAgent::configure(&RgwAgent::default(), &ctx).await;
    let err = match res {
        Ok(()) => panic!("expected a gateway without a keyring to fail"),
        Err(err) => err,
    };
    assert!(castle_core::AppError::is_not_found(&err), "unexpected error, got {:#}", err);
    cluster.shutdown().await
}
