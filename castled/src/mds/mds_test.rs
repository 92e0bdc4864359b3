use anyhow::Result;

use super::*;
use crate::fixtures::TestCluster;
use castle_core::kvs::MemKvs;
use castle_core::AppError;

async fn three_nodes() -> Result<TestCluster> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.add_node("b", "1.2.3.5").await?;
    cluster.add_node("c", "1.2.3.6").await?;
    cluster.refresh("a").await?;
    Ok(cluster)
}

#[tokio::test]
async fn filesystem_names_are_validated() -> Result<()> {
    let kvs = MemKvs::new();
    for (name, pool) in [("", "pool"), ("my fs", "pool"), ("a/b", "pool"), ("myfs", "")] {
        let err = match add_filesystem(&kvs, "castle", name, pool).await {
            Ok(()) => panic!("expected {:?} on pool {:?} to be rejected", name, pool),
            Err(err) => err,
        };
        assert!(AppError::is_config_invalid(&err), "unexpected error for {:?}, got {:#}", name, err);
    }

    let err = match remove_filesystem(&kvs, "castle", "missing").await {
        Ok(()) => panic!("expected removing an unknown file system to fail"),
        Err(err) => err,
    };
    assert!(AppError::is_not_found(&err), "unexpected error, got {:#}", err);
    Ok(())
}

#[tokio::test]
async fn add_and_remove_filesystem() -> Result<()> {
    let cluster = three_nodes().await?;
    let kvs = cluster.kvs.as_ref();

    add_filesystem(kvs, "castle", "myfs", "mypool").await?;
    cluster.refresh("a").await?;

    for expected in ["ceph osd pool create myfs-data", "ceph osd pool create myfs-metadata", "ceph fs new myfs myfs-metadata myfs-data"] {
        let found = cluster.executor.matching(&format!("^{}", regex::escape(expected)));
        assert!(found.len() == 1, "unexpected executions of {:?}, got {:?}", expected, found);
    }
    let desired = load_mds(kvs, "castle", false).await?;
    assert!(desired.len() == 1, "unexpected desired mds, got {:?}", desired);
    let mds = &desired[0];
    assert!(mds.id == 1 && mds.filesystem == "myfs", "unexpected mds placement {:?}", mds);
    let host = cluster.node(&mds.node_id)?;
    assert!(host.supervisor.is_running(MDS_BINARY, "--id=1"), "expected mds.1 to run on node {}", mds.node_id);
    let keyring = host.config_root().join("mds1").join("keyring");
    assert!(tokio::fs::metadata(&keyring).await.is_ok(), "expected a keyring at {}", keyring.display());
    let applied = load_filesystems(kvs, "castle", true).await?;
    assert!(applied.get("myfs").map(String::as_str) == Some("mypool"), "unexpected applied file systems {:?}", applied);
    assert!(load_mds(kvs, "castle", true).await? == desired, "expected the applied mds to match the desired one");

    // A second pass must not create the file system again.
    cluster.refresh("a").await?;
    let created = cluster.executor.matching("^ceph fs new ");
    assert!(created.len() == 1, "unexpected file system creations, got {:?}", created);

    remove_filesystem(kvs, "castle", "myfs").await?;
    cluster.refresh("a").await?;

    for expected in ["ceph fs set myfs cluster_down true", "ceph mds fail 4100", "ceph fs rm myfs"] {
        let found = cluster.executor.matching(&format!("^{}", regex::escape(expected)));
        assert!(found.len() == 1, "unexpected executions of {:?}, got {:?}", expected, found);
    }
    let stops = host.supervisor.stops();
    assert!(stops.iter().any(|name| name == "mds.1"), "expected mds.1 to be stopped, got {:?}", stops);
    assert!(!host.supervisor.is_running(MDS_BINARY, "--id=1"), "expected no mds to remain");
    let applied = load_filesystems(kvs, "castle", true).await?;
    assert!(applied.is_empty(), "unexpected applied file systems {:?}", applied);
    let applied = load_mds(kvs, "castle", true).await?;
    assert!(applied.is_empty(), "unexpected applied mds {:?}", applied);
    cluster.shutdown().await
}

#[tokio::test]
async fn second_filesystem_gets_its_own_node() -> Result<()> {
    let cluster = three_nodes().await?;
    let kvs = cluster.kvs.as_ref();

    add_filesystem(kvs, "castle", "one", "pool1").await?;
    add_filesystem(kvs, "castle", "two", "pool2").await?;
    cluster.refresh("a").await?;

    let desired = load_mds(kvs, "castle", false).await?;
    assert!(desired.len() == 2, "unexpected desired mds, got {:?}", desired);
    let ids: Vec<u32> = desired.iter().map(|rec| rec.id).collect();
    assert!(ids.contains(&1) && ids.contains(&2), "unexpected mds ids, got {:?}, expected 1 and 2", ids);
    assert!(desired[0].node_id != desired[1].node_id, "expected each mds on its own node, got {:?}", desired);
    cluster.shutdown().await
}
