use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::StreamExt;

use super::*;
use castle_core::keys;
use castle_core::kvs::{Kvs, MemKvs};

/// Answer the next trigger of `service` on `node` with the given status.
fn spawn_responder(kvs: Arc<MemKvs>, node: &str, service: &str, status: &str) -> tokio::task::JoinHandle<Result<()>> {
    let (node, service, status) = (node.to_string(), service.to_string(), status.to_string());
    let mut triggers = kvs.watch(&keys::trigger_key("castle", &node, &service));
    tokio::spawn(async move {
        if triggers.next().await.is_some() {
            kvs.set(&keys::status_key(&node, &service), &status).await?;
        }
        Ok(())
    })
}

#[tokio::test]
async fn trigger_and_wait_times_out_without_reports() -> Result<()> {
    let kvs = MemKvs::new();
    let timeout = Duration::from_millis(300);
    let start = Instant::now();

    let outcome = trigger_and_wait(&kvs, "castle", &["a".to_string()], "osd", 1, timeout).await?;

    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "expected to wait for the full timeout, waited {:?}", elapsed);
    assert!(elapsed < timeout * 4, "waited far longer than the timeout, waited {:?}", elapsed);
    assert!(!outcome.is_success(), "expected the outcome to fail, got {:?}", outcome);
    assert!(outcome.timed_out.contains("a"), "expected node a to time out, got {:?}", outcome.timed_out);
    let marker = kvs.get(&keys::trigger_key("castle", "a", "osd")).await?;
    assert!(marker.as_deref() == Some("1"), "unexpected trigger marker, got {:?}, expected 1", marker);
    Ok(())
}

#[tokio::test]
async fn trigger_and_wait_returns_after_required_successes() -> Result<()> {
    let kvs = Arc::new(MemKvs::new());
    let responders = vec![
        spawn_responder(kvs.clone(), "a", "monitor", "succeeded"),
        spawn_responder(kvs.clone(), "b", "monitor", "succeeded"),
    ];
    let start = Instant::now();

    let nodes = vec!["a".to_string(), "b".to_string()];
    let outcome = trigger_and_wait(kvs.as_ref(), "castle", &nodes, "monitor", 2, Duration::from_secs(10)).await?;

    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(5), "expected to return as soon as both reported, waited {:?}", elapsed);
    assert!(outcome.is_success(), "expected success, got {:?}", outcome);
    assert!(outcome.succeeded.len() == 2, "unexpected success count, got {}, expected {}", outcome.succeeded.len(), 2);
    for handle in responders {
        handle.await??;
    }
    Ok(())
}

#[tokio::test]
async fn trigger_and_wait_collects_failures() -> Result<()> {
    let kvs = Arc::new(MemKvs::new());
    // A stale success from an earlier pass must not count.
    kvs.set(&keys::status_key("b", "mds"), "succeeded").await?;
    let responders = vec![
        spawn_responder(kvs.clone(), "a", "mds", "succeeded"),
        spawn_responder(kvs.clone(), "b", "mds", "error starting mds"),
    ];

    let nodes = vec!["a".to_string(), "b".to_string()];
    let outcome = trigger_and_wait(kvs.as_ref(), "castle", &nodes, "mds", 2, Duration::from_secs(10)).await?;

    assert!(!outcome.is_success(), "expected failure, got {:?}", outcome);
    let err = outcome.failed.get("b").cloned().unwrap_or_default();
    assert!(err == "error starting mds", "unexpected failure for node b, got {:?}", err);
    assert!(outcome.ensure("mds").is_err(), "expected ensure to fail");
    for handle in responders {
        handle.await??;
    }
    Ok(())
}

#[tokio::test]
async fn report_status_writes_once() -> Result<()> {
    let kvs = MemKvs::new();

    report_status(&kvs, "a", "rgw", &Ok(())).await?;
    let writes = kvs.write_count();
    report_status(&kvs, "a", "rgw", &Ok(())).await?;

    assert!(kvs.write_count() == writes, "expected no write for an unchanged status, got {} writes, expected {}", kvs.write_count(), writes);
    report_status(&kvs, "a", "rgw", &Err(anyhow::anyhow!("boom"))).await?;
    let status = kvs.get(&keys::status_key("a", "rgw")).await?;
    assert!(status.as_deref() == Some("boom"), "unexpected status, got {:?}, expected boom", status);
    Ok(())
}

#[test]
fn refresh_events_merge_node_sets() {
    let mut event = RefreshEvent::new(RefreshReason::Inventory);
    event.nodes_added.insert("a".into());
    let mut other = RefreshEvent::new(RefreshReason::Manual);
    other.nodes_removed.insert("b".into());

    event.merge(other);

    assert!(event.reason == RefreshReason::Manual, "unexpected reason, got {:?}, expected Manual", event.reason);
    assert!(event.nodes_added.contains("a") && event.nodes_removed.contains("b"), "unexpected merged event {:?}", event);
}
