//! Leader election over the KVS.
//!
//! The lease is a pair of keys under `/_leader/<cluster>`: the holder's identity and the last time
//! it renewed. A candidate takes the lease when nobody holds it, when the holder's renewal is
//! older than the lease duration, or when it already holds it. The store offers no
//! compare-and-swap, so after writing the lease a candidate reads it back and only leads if its
//! own write survived.
//!
//! Leader passes must only be run while the elector reports `Leading`.

use std::time::Duration;

use anyhow::{ensure, Result};
use chrono::prelude::*;
use futures::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use castle_core::keys;
use castle_core::kvs::DynKvs;

const KEY_HOLDER: &str = "holder";
const KEY_RENEWED: &str = "renewed";

const METRIC_IS_LEADER: &str = "castle_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "castle_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This node holds the lease.
    Leading,
    /// A different node holds the lease, identified by the encapsulated string.
    Following(String),
    /// The lease state is unknown, or the elector is starting or stopping.
    Standby,
}

/// Timings of the lease.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// How long a lease stays valid after its last renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps leading while its renewals fail.
    pub renew_deadline: Duration,
    /// The time between two acquire or renew attempts.
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(renew_deadline > retry_period, "renew_deadline must be greater than retry_period");
        ensure!(!retry_period.is_zero(), "retry_period must not be zero");
        Ok(Self {
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }
}

/// The lease as read from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub renewed: Option<DateTime<Utc>>,
}

impl Lease {
    /// Check if `identity` may write the lease at `now`.
    pub fn is_available_to(&self, identity: &str, now: DateTime<Utc>, lease_duration: Duration) -> bool {
        if self.holder.is_empty() || self.holder == identity {
            return true;
        }
        match (self.renewed, chrono::Duration::from_std(lease_duration)) {
            (Some(renewed), Ok(duration)) => renewed + duration < now,
            _ => true,
        }
    }
}

/// A task acquiring and maintaining the lease of a cluster.
pub struct Elector {
    kvs: DynKvs,
    lease_key: String,
    identity: String,
    config: LeaseConfig,
    state_tx: watch::Sender<LeaderState>,
    state: LeaderState,
    /// The last time the lease was successfully written by us.
    last_renewal: Option<Instant>,
    shutdown: BroadcastStream<()>,
}

impl Elector {
    pub fn new(kvs: DynKvs, cluster: &str, identity: String, config: LeaseConfig, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_counter!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes observed by this node");
        metrics::register_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "1.0 while this node leads, 0.0 otherwise");
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            Self {
                kvs,
                lease_key: keys::lease_key(cluster),
                identity,
                config,
                state_tx,
                state: LeaderState::Standby,
                last_renewal: None,
                shutdown: BroadcastStream::new(shutdown),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(identity = %self.identity, "leader elector task started");
        let mut ticker = tokio::time::interval(self.config.retry_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                _ = self.shutdown.next() => break,
            }
        }

        // Step down so that another node can take over without waiting out the lease.
        if self.state == LeaderState::Leading {
            if let Err(err) = self.kvs.delete(&self.lease_key, true).await {
                tracing::error!(error = ?err, "error releasing lease");
            }
        }
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    /// Run one acquire or renew attempt, handling failures.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        match self.try_acquire_or_renew(now).await {
            Ok(state) => self.set_state(state),
            Err(err) => {
                tracing::error!(error = ?err, "error during lease acquire or renew");
                let expired = self.last_renewal.map(|at| at.elapsed() >= self.config.renew_deadline).unwrap_or(true);
                if self.state != LeaderState::Leading || expired {
                    self.set_state(LeaderState::Standby);
                }
            }
        }
    }

    /// Read the lease and take or renew it if it is ours to take.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn try_acquire_or_renew(&mut self, now: DateTime<Utc>) -> Result<LeaderState> {
        let lease = self.read_lease().await?;
        if !lease.is_available_to(&self.identity, now, self.config.lease_duration) {
            return Ok(LeaderState::Following(lease.holder));
        }

        self.kvs.set(&keys::join([self.lease_key.as_str(), KEY_HOLDER]), &self.identity).await?;
        self.kvs.set(&keys::join([self.lease_key.as_str(), KEY_RENEWED]), &now.to_rfc3339()).await?;
        let written = self.read_lease().await?;
        if written.holder != self.identity {
            return Ok(LeaderState::Following(written.holder));
        }
        self.last_renewal = Some(Instant::now());
        Ok(LeaderState::Leading)
    }

    async fn read_lease(&self) -> Result<Lease> {
        let tree = self.kvs.get_tree(&self.lease_key).await?;
        Ok(Lease {
            holder: tree.get(KEY_HOLDER).cloned().unwrap_or_default(),
            renewed: tree
                .get(KEY_RENEWED)
                .and_then(|val| DateTime::parse_from_rfc3339(val).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        })
    }

    fn set_state(&mut self, state: LeaderState) {
        if self.state == state {
            return;
        }
        tracing::info!(old = ?self.state, new = ?state, "leader state changed");
        metrics::increment_counter!(METRIC_LEADERSHIP_CHANGE);
        let leading = if state == LeaderState::Leading { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, leading);
        self.state = state.clone();
        let _ = self.state_tx.send(state);
    }

    pub fn state(&self) -> &LeaderState {
        &self.state
    }
}

#[cfg(test)]
#[path = "election_test.rs"]
mod election_test;
