use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;

use crate::kvs::{set_if_changed, EtcdKvs, Kvs, MemKvs, SledKvs, WatchAction};

async fn exercise_tree_semantics(kvs: &dyn Kvs) -> Result<()> {
    kvs.set("/services/ceph/fsid", "abc").await?;
    kvs.set("/services/ceph/monitor/desired/a/id", "mon0").await?;
    kvs.set("/services/ceph/monitor/desired/a/port", "6790").await?;
    kvs.set("/services/ceph/monitor/desired/b/id", "mon1").await?;
    kvs.set("/services/ceph-other/fsid", "xyz").await?;

    let val = kvs.get("/services/ceph/fsid").await?;
    assert!(val.as_deref() == Some("abc"), "unexpected fsid, got {:?}, expected {:?}", val, Some("abc"));
    let missing = kvs.get("/services/ceph/name").await?;
    assert!(missing.is_none(), "expected missing key to yield None, got {:?}", missing);

    let children = kvs.list_children("/services/ceph/monitor/desired").await?;
    let expected: Vec<_> = vec!["a".to_string(), "b".to_string()];
    assert!(
        children.iter().cloned().collect::<Vec<_>>() == expected,
        "unexpected children, got {:?}, expected {:?}",
        children,
        expected
    );
    let roots = kvs.list_children("/services").await?;
    assert!(roots.len() == 2, "expected sibling prefixes to be distinct children, got {:?}", roots);

    let tree = kvs.get_tree("/services/ceph/monitor/desired/a").await?;
    assert!(tree.len() == 2, "expected 2 keys in tree, got {}", tree.len());
    assert!(tree.get("port").map(String::as_str) == Some("6790"), "unexpected tree contents {:?}", tree);

    // Non-recursive delete of a directory leaves its children alone.
    kvs.delete("/services/ceph/monitor/desired/a", false).await?;
    let tree = kvs.get_tree("/services/ceph/monitor/desired/a").await?;
    assert!(tree.len() == 2, "expected non-recursive delete to keep children, got {:?}", tree);

    kvs.delete("/services/ceph/monitor/desired/a", true).await?;
    let children = kvs.list_children("/services/ceph/monitor/desired").await?;
    assert!(children.len() == 1 && children.contains("b"), "unexpected children after delete, got {:?}", children);

    // Prefix matching respects segment boundaries.
    kvs.delete("/services/ceph", true).await?;
    let other = kvs.get("/services/ceph-other/fsid").await?;
    assert!(other.as_deref() == Some("xyz"), "recursive delete leaked into sibling prefix, got {:?}", other);

    // Deleting a missing key is not an error.
    kvs.delete("/does/not/exist", true).await?;
    Ok(())
}

#[tokio::test]
async fn mem_kvs_tree_semantics() -> Result<()> {
    let kvs = MemKvs::new();
    exercise_tree_semantics(&kvs).await
}

#[tokio::test]
async fn sled_kvs_tree_semantics() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let kvs = SledKvs::open(tmpdir.path().join("kvs")).await?;
    exercise_tree_semantics(&kvs).await
}

#[tokio::test]
async fn sled_kvs_survives_reopen() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("kvs");
    {
        let kvs = SledKvs::open(&path).await?;
        kvs.set("/services/ceph/fsid", "abc").await?;
        kvs.flush().await?;
    }
    let kvs = SledKvs::open(&path).await?;
    let val = kvs.get("/services/ceph/fsid").await?;
    assert!(val.as_deref() == Some("abc"), "expected value to survive reopen, got {:?}", val);
    Ok(())
}

async fn exercise_watch_order(kvs: &dyn Kvs) -> Result<()> {
    kvs.delete("/_notify", true).await?;
    let mut watch = kvs.watch("/_notify/a/osd");

    kvs.set("/_notify/b/osd/status", "ignored").await?;
    kvs.set("/_notify/a/osd/status", "failed").await?;
    kvs.set("/_notify/a/osd/status", "succeeded").await?;
    kvs.delete("/_notify/a/osd/status", false).await?;

    let mut actions = vec![];
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .context("timeout waiting for watch event")?
            .context("watch stream closed unexpectedly")?;
        assert!(event.key == "/_notify/a/osd/status", "unexpected key in watch event, got {}", event.key);
        actions.push((event.action, event.value));
    }
    let expected = vec![
        (WatchAction::Create, Some("failed".to_string())),
        (WatchAction::Update, Some("succeeded".to_string())),
        (WatchAction::Delete, None),
    ];
    assert!(actions == expected, "unexpected watch events, got {:?}, expected {:?}", actions, expected);
    Ok(())
}

#[tokio::test]
async fn watch_reports_create_update_delete_in_order() -> Result<()> {
    exercise_watch_order(&MemKvs::new()).await
}

/// Connect to the etcd cluster named by `CASTLE_TEST_ETCD_ENDPOINTS`, if any.
async fn test_etcd() -> Result<Option<EtcdKvs>> {
    let endpoints = match std::env::var("CASTLE_TEST_ETCD_ENDPOINTS") {
        Ok(endpoints) if !endpoints.is_empty() => endpoints,
        _ => return Ok(None),
    };
    let endpoints: Vec<&str> = endpoints.split(',').map(str::trim).collect();
    Ok(Some(EtcdKvs::connect(&endpoints).await?))
}

#[tokio::test]
async fn etcd_kvs_tree_semantics() -> Result<()> {
    let kvs = match test_etcd().await? {
        Some(kvs) => kvs,
        None => return Ok(()),
    };
    kvs.delete("/services", true).await?;
    exercise_tree_semantics(&kvs).await
}

#[tokio::test]
async fn etcd_kvs_watch_order() -> Result<()> {
    match test_etcd().await? {
        Some(kvs) => exercise_watch_order(&kvs).await,
        None => Ok(()),
    }
}

#[tokio::test]
async fn set_if_changed_skips_identical_writes() -> Result<()> {
    let kvs = MemKvs::new();
    assert!(set_if_changed(&kvs, "/a/b", "1").await?, "expected first write to happen");
    let before = kvs.write_count();
    assert!(!set_if_changed(&kvs, "/a/b", "1").await?, "expected identical write to be skipped");
    assert!(kvs.write_count() == before, "expected no new writes, got {} vs {}", kvs.write_count(), before);
    assert!(set_if_changed(&kvs, "/a/b", "2").await?, "expected changed write to happen");
    Ok(())
}
