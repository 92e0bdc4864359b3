use anyhow::Result;

use super::*;
use crate::bus::{RefreshEvent, RefreshReason};
use crate::ceph::cluster::{self, ClusterInfo};
use crate::fixtures::{self, quorum_status, TestCluster};
use castle_core::keys;
use castle_core::kvs::Kvs;
use castle_core::AppError;

#[test]
fn monitor_count_follows_node_count() {
    let cases = [(0, 0), (1, 1), (2, 1), (3, 3), (20, 3), (21, 5), (100, 5), (101, 7), (1000, 7)];
    for (nodes, expected) in cases {
        let got = monitor_count(nodes);
        assert!(got == expected, "unexpected monitor count for {} nodes, got {}, expected {}", nodes, got, expected);
    }
}

/// The desired monitors of the test cluster as `(node, name)` pairs.
async fn desired_monitors(cluster: &TestCluster) -> Result<Vec<(String, String)>> {
    Ok(cluster::load_monitors(cluster.kvs.as_ref(), "castle", false)
        .await?
        .into_iter()
        .map(|rec| (rec.node_id, rec.name))
        .collect())
}

fn mon_starts(cluster: &TestCluster, node: &str) -> Result<Vec<fixtures::FakeProc>> {
    Ok(cluster.node(node)?.supervisor.starts().into_iter().filter(|proc| proc.binary == "ceph-mon").collect())
}

#[tokio::test]
async fn bootstrap_single_node() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;

    cluster.refresh("a").await?;

    let mons = cluster::load_monitors(cluster.kvs.as_ref(), "castle", false).await?;
    assert!(mons.len() == 1, "unexpected monitor count, got {}, expected 1", mons.len());
    let mon = &mons[0];
    assert!(mon.node_id == "a" && mon.name == "mon0", "unexpected monitor {:?}", mon);
    assert!(mon.port == 6790, "unexpected monitor port, got {}, expected 6790", mon.port);

    let info = ClusterInfo::must_load(cluster.kvs.as_ref(), "castle").await?;
    assert!(!info.fsid.is_empty(), "expected an fsid to be generated");
    assert!(!info.monitor_secret.is_empty() && !info.admin_secret.is_empty(), "expected both secrets to be generated");
    let sentinel = cluster.kvs.get("/services/castle/crushMapInitialized").await?;
    assert!(sentinel.as_deref() == Some("1"), "unexpected crush sentinel, got {:?}, expected 1", sentinel);

    let starts = mon_starts(&cluster, "a")?;
    assert!(starts.len() == 1, "unexpected number of monitor starts, got {}, expected 1", starts.len());
    assert!(
        starts[0].args.iter().any(|arg| arg == "--public-addr=1.2.3.4:6790"),
        "expected the monitor to serve on its public address, got {:?}",
        starts[0].args
    );
    let mkfs = cluster.node("a")?.supervisor.runs();
    assert!(mkfs.iter().any(|run| run.binary == "ceph-mon"), "expected a monitor mkfs run, got {:?}", mkfs);

    let applied = cluster::load_monitors(cluster.kvs.as_ref(), "castle", true).await?;
    assert!(applied == mons, "unexpected applied monitors, got {:?}, expected {:?}", applied, mons);
    cluster.shutdown().await
}

#[tokio::test]
async fn grow_to_three_monitors() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.refresh("a").await?;

    cluster.add_node("b", "1.2.3.5").await?;
    cluster.add_node("c", "1.2.3.6").await?;
    cluster.refresh("a").await?;

    let mons = desired_monitors(&cluster).await?;
    let names: Vec<&str> = mons.iter().map(|(_, name)| name.as_str()).collect();
    assert!(mons.len() == 3, "unexpected monitors, got {:?}, expected 3", mons);
    assert!(mons[0] == ("a".to_string(), "mon0".to_string()), "expected mon0 to stay on node a, got {:?}", mons[0]);
    assert!(names.contains(&"mon1") && names.contains(&"mon2"), "unexpected monitor names, got {:?}", names);
    for node in ["b", "c"] {
        let starts = mon_starts(&cluster, node)?;
        assert!(starts.len() == 1, "unexpected monitor starts on node {}, got {}, expected 1", node, starts.len());
    }
    let starts = mon_starts(&cluster, "a")?;
    assert!(starts.len() == 1, "expected the existing monitor to be left alone, got {} starts", starts.len());
    cluster.shutdown().await
}

#[tokio::test]
async fn replace_unhealthy_monitor() -> Result<()> {
    let mut cluster = TestCluster::new();
    for (node, ip) in [("a", "1.2.3.4"), ("b", "1.2.3.5"), ("c", "1.2.3.6")] {
        cluster.add_node(node, ip).await?;
    }
    cluster.refresh("b").await?;

    fixtures::make_unhealthy(cluster.kvs.as_ref(), "a").await?;
    cluster.add_node("d", "1.2.3.7").await?;
    cluster.refresh("b").await?;

    let nodes: Vec<String> = desired_monitors(&cluster).await?.into_iter().map(|(node, _)| node).collect();
    assert!(nodes == ["b", "c", "d"], "unexpected monitor nodes, got {:?}, expected [b, c, d]", nodes);
    let removes = cluster.executor.matching("^ceph mon remove mon0 ");
    assert!(removes.len() == 1, "expected mon0 to be removed from quorum once, got {:?}", removes);
    let stops = cluster.node("a")?.supervisor.stops();
    assert!(stops.contains(&"mon.mon0".to_string()), "expected the monitor on node a to be stopped, got {:?}", stops);
    let applied = cluster.kvs.list_children(&keys::applied_key("castle", "monitor")).await?;
    assert!(!applied.contains("a"), "expected the retired monitor to leave the applied state, got {:?}", applied);
    cluster.shutdown().await
}

#[tokio::test]
async fn quorum_loss_fails_the_pass() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.executor.on("^ceph mon_status", &quorum_status(&[]));

    let res = cluster.refresh("a").await;

    let err = match res {
        Ok(_) => anyhow::bail!("expected the refresh to fail without quorum"),
        Err(err) => err,
    };
    let is_quorum_loss = err.chain().any(|cause| matches!(cause.downcast_ref::<AppError>(), Some(AppError::QuorumLoss(_))));
    assert!(is_quorum_loss, "expected a quorum loss, got {:#}", err);
    let applied = cluster.kvs.list_children(&keys::applied_key("castle", "monitor")).await?;
    assert!(applied.is_empty(), "expected no applied monitors, got {:?}", applied);
    cluster.shutdown().await
}

#[tokio::test]
async fn unchanged_refresh_is_idempotent() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.refresh("a").await?;
    let (writes, starts) = (cluster.kvs.write_count(), cluster.node("a")?.supervisor.starts().len());

    cluster.refresh_with("a", RefreshEvent::new(RefreshReason::Inventory)).await?;

    assert!(cluster.kvs.write_count() == writes, "unexpected writes, got {}, expected {}", cluster.kvs.write_count(), writes);
    let got = cluster.node("a")?.supervisor.starts().len();
    assert!(got == starts, "unexpected process starts, got {}, expected {}", got, starts);
    cluster.shutdown().await
}
