//! The orchestration bus.
//!
//! Leaders never talk to agents directly. They set a trigger marker under each target node and
//! wait for the agents to publish the outcome of their reconcile on the node's status key.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use castle_core::keys;
use castle_core::kvs::{self, Kvs, WatchAction};

const METRIC_TRIGGER_TIMEOUTS: &str = "castle_trigger_timeouts";

/// Why a refresh was requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshReason {
    /// The leader just took office or the daemon just started.
    Startup,
    /// An operator asked for it.
    Manual,
    /// A watched desired-state key changed.
    DesiredChanged(String),
    /// Node membership or health changed.
    Inventory,
}

/// The unit of work that drives a leader pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshEvent {
    pub reason: RefreshReason,
    pub nodes_added: BTreeSet<String>,
    pub nodes_changed: BTreeSet<String>,
    pub nodes_removed: BTreeSet<String>,
}

impl RefreshEvent {
    pub fn new(reason: RefreshReason) -> Self {
        Self {
            reason,
            nodes_added: BTreeSet::new(),
            nodes_changed: BTreeSet::new(),
            nodes_removed: BTreeSet::new(),
        }
    }

    /// Fold a later event into this one.
    pub fn merge(&mut self, other: RefreshEvent) {
        if self.reason != RefreshReason::Manual {
            self.reason = other.reason;
        }
        self.nodes_added.extend(other.nodes_added);
        self.nodes_changed.extend(other.nodes_changed);
        self.nodes_removed.extend(other.nodes_removed);
    }
}

/// The outcome of a trigger-and-wait.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub succeeded: BTreeSet<String>,
    /// Nodes which reported a failure, along with the reported error.
    pub failed: BTreeMap<String, String>,
    /// Nodes which did not report before the deadline.
    pub timed_out: BTreeSet<String>,
    pub required: usize,
}

impl TriggerOutcome {
    pub fn is_success(&self) -> bool {
        self.succeeded.len() >= self.required
    }

    /// Turn an unsuccessful outcome into an error.
    pub fn ensure(&self, service: &str) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        bail!(
            "{} agents did not complete: {} of {} required succeeded, failed {:?}, timed out {:?}",
            service,
            self.succeeded.len(),
            self.required,
            self.failed,
            self.timed_out,
        )
    }
}

/// Trigger the agents of `service` on the given nodes and wait until `required` of them report
/// success, all of them report, or `timeout` passes.
#[tracing::instrument(level = "debug", skip(kvs))]
pub async fn trigger_and_wait(kvs: &dyn Kvs, cluster: &str, nodes: &[String], service: &str, required: usize, timeout: Duration) -> Result<TriggerOutcome> {
    let targets: BTreeSet<String> = nodes.iter().cloned().collect();
    let mut outcome = TriggerOutcome {
        required,
        ..Default::default()
    };
    if targets.is_empty() {
        return Ok(outcome);
    }

    // Subscribe before triggering so that no report can be missed.
    let status_keys: BTreeMap<String, String> = targets.iter().map(|node| (keys::status_key(node, service), node.clone())).collect();
    let mut reports = stream::select_all(status_keys.keys().map(|key| kvs.watch(key)));

    for node in targets.iter() {
        kvs.delete(&keys::status_key(node, service), false).await?;
        kvs.set(&keys::trigger_key(cluster, node, service), keys::MARKER_SET).await?;
    }

    let deadline = Instant::now() + timeout;
    while outcome.succeeded.len() + outcome.failed.len() < targets.len() {
        let event = match tokio::time::timeout_at(deadline, reports.next()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        let (node, value) = match (status_keys.get(&event.key), event.value) {
            (Some(node), Some(value)) if event.action != WatchAction::Delete => (node.clone(), value),
            _ => continue,
        };
        if value == keys::STATUS_SUCCEEDED {
            tracing::debug!(node = %node, service, "agent reported success");
            outcome.failed.remove(&node);
            outcome.succeeded.insert(node);
            if required > 0 && outcome.succeeded.len() >= required {
                break;
            }
        } else {
            tracing::warn!(node = %node, service, error = %value, "agent reported failure");
            outcome.failed.insert(node, value);
        }
    }

    outcome.timed_out = targets
        .iter()
        .filter(|node| !outcome.succeeded.contains(*node) && !outcome.failed.contains_key(*node))
        .cloned()
        .collect();
    if !outcome.timed_out.is_empty() && !outcome.is_success() {
        metrics::increment_counter!(METRIC_TRIGGER_TIMEOUTS, "service" => service.to_string());
    }
    Ok(outcome)
}

/// Publish the outcome of an agent's reconcile, writing only if the value changed.
pub async fn report_status(kvs: &dyn Kvs, node: &str, service: &str, res: &Result<()>) -> Result<()> {
    let status = match res {
        Ok(_) => keys::STATUS_SUCCEEDED.to_string(),
        Err(err) => format!("{:#}", err),
    };
    kvs::set_if_changed(kvs, &keys::status_key(node, service), &status).await?;
    Ok(())
}

pub fn register_metrics() {
    metrics::register_counter!(METRIC_TRIGGER_TIMEOUTS, metrics::Unit::Count, "trigger-and-wait calls which timed out");
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
