use anyhow::Result;
use chrono::prelude::*;

use super::*;
use crate::fixtures::{self, TestCluster};

#[tokio::test]
async fn beat_publishes_disks_and_heartbeat() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    cluster.executor.with_disks(&[("sdx", 100 * fixtures::PARTITION_SIZE, "uuid-x")]);
    let node = cluster.node("a")?;
    let (_tx, rx) = broadcast::channel(1);
    let mut heartbeat = Heartbeat::new(node.services.clone(), rx);

    let now = Utc::now();
    heartbeat.beat(now).await?;
    let record = inventory::load_node(cluster.kvs.as_ref(), "a").await?;
    let disk = record.disk_by_name("sdx").cloned().unwrap_or_default();
    assert!(disk.uuid == "uuid-x", "unexpected disk uuid, got {:?}, expected uuid-x", disk.uuid);
    let published = record.heartbeat.map(|hb| hb.timestamp());
    assert!(published == Some(now.timestamp()), "unexpected heartbeat, got {:?}, expected {}", published, now.timestamp());

    // A disk that disappears is dropped from the record.
    cluster.executor.with_disks(&[("sdy", 100 * fixtures::PARTITION_SIZE, "uuid-y")]);
    heartbeat.beat(Utc::now()).await?;
    let record = inventory::load_node(cluster.kvs.as_ref(), "a").await?;
    let names: Vec<&str> = record.disks.iter().map(|disk| disk.name.as_str()).collect();
    assert!(names == ["sdy"], "unexpected disks, got {:?}, expected only sdy", names);
    cluster.shutdown().await
}

#[tokio::test]
async fn failed_discovery_still_beats() -> Result<()> {
    let mut cluster = TestCluster::new();
    cluster.add_node("a", "1.2.3.4").await?;
    fixtures::make_unhealthy(cluster.kvs.as_ref(), "a").await?;
    cluster.executor.fail("^lsblk --all", "lsblk exploded");
    let node = cluster.node("a")?;
    let (_tx, rx) = broadcast::channel(1);
    let mut heartbeat = Heartbeat::new(node.services.clone(), rx);

    let now = Utc::now();
    heartbeat.beat(now).await?;
    let record = inventory::load_node(cluster.kvs.as_ref(), "a").await?;
    let threshold = node.services.config.unhealthy_threshold();
    assert!(record.is_healthy(Utc::now(), threshold), "expected the node to be healthy again, got heartbeat {:?}", record.heartbeat);
    cluster.shutdown().await
}
