//! Lease-based leader election
//!
//! Replicas of the operator compete for a `coordination.k8s.io/v1` Lease;
//! only the holder runs the controller. A holder renews the lease every
//! retry period and steps down when it cannot renew within the renew
//! deadline. Expiry of someone else's lease is judged against the local
//! monotonic clock at which this replica last saw the record change, so wall
//! clock skew between replicas does not matter.

use crate::defaults::{LEASE_DURATION, RENEW_DEADLINE, RETRY_PERIOD};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease duration written when stepping down, so others take over quickly
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Contents of the lease relevant to the election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    /// Version of the stored object, used for compare-and-swap updates
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    fn held_by_other(&self, identity: &str) -> bool {
        matches!(self.holder_identity.as_deref(), Some(holder) if !holder.is_empty() && holder != identity)
    }
}

/// Storage of the lease record
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Human readable location of the lock, for logs
    fn describe(&self) -> String;

    async fn get(&self) -> Result<Option<LeaseRecord>>;

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord>;

    /// Replace the record; fails with a conflict if `record.resource_version`
    /// is no longer current
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord>;
}

/// [`LeaseLock`] stored in a Lease object
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(
                    i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }
}

fn record_from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds.unwrap_or(0).max(0) as u64
        ),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<LeaseRecord>> {
        Ok(self.api.get_opt(&self.name).await?.map(record_from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let lease = self
            .api
            .create(&PostParams::default(), &self.to_lease(record))
            .await?;
        Ok(record_from_lease(lease))
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        let lease = self
            .api
            .replace(&self.name, &PostParams::default(), &self.to_lease(record))
            .await?;
        Ok(record_from_lease(lease))
    }
}

/// Timing and identity of an elector
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }

    /// Check that a holder can renew before others consider the lease expired
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "leader election identity must not be empty".to_string(),
            ));
        }
        if self.retry_period.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "retry period must be positive".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(OperatorError::InvalidConfig(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(OperatorError::InvalidConfig(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

/// Election state of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Candidate,
    Leading,
    Released,
}

/// Invoked on leadership transitions
#[async_trait]
pub trait LeadershipCallbacks: Send + Sync {
    async fn on_started_leading(&self);
    async fn on_stopped_leading(&self);
}

/// Identity of this replica: `HOSTNAME`, then `/etc/hostname`, then a random id
pub fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Competes for one lease on behalf of this replica
pub struct LeaderElector {
    lock: Box<dyn LeaseLock>,
    config: LeaderElectionConfig,
    state: Mutex<LeaderState>,
    /// Last record seen and when it was first seen in that form
    observed: Mutex<Option<(LeaseRecord, Instant)>>,
}

impl LeaderElector {
    pub fn new(lock: Box<dyn LeaseLock>, config: LeaderElectionConfig) -> Self {
        Self {
            lock,
            config,
            state: Mutex::new(LeaderState::Candidate),
            observed: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LeaderState {
        *self.state.lock()
    }

    fn set_state(&self, state: LeaderState) {
        *self.state.lock() = state;
        metrics::gauge!("dgraph_operator_leader").set(if state == LeaderState::Leading {
            1.0
        } else {
            0.0
        });
    }

    fn observe(&self, record: &LeaseRecord) {
        let mut observed = self.observed.lock();
        let changed = observed.as_ref().map_or(true, |(seen, _)| seen != record);
        if changed {
            *observed = Some((record.clone(), Instant::now()));
        }
    }

    fn observed_expired(&self) -> bool {
        self.observed
            .lock()
            .as_ref()
            .map_or(true, |(record, seen_at)| {
                seen_at.elapsed() >= record.lease_duration
            })
    }

    /// One attempt to take or keep the lease; `Ok(true)` when we hold it
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let mut desired = LeaseRecord {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
            resource_version: None,
        };

        let Some(current) = self.lock.get().await? else {
            return match self.lock.create(&desired).await {
                Ok(created) => {
                    self.observe(&created);
                    Ok(true)
                }
                Err(e) if e.is_already_exists() => Ok(false),
                Err(e) => Err(e),
            };
        };

        self.observe(&current);
        if current.held_by_other(&self.config.identity) && !self.observed_expired() {
            debug!(
                holder = current.holder_identity.as_deref().unwrap_or_default(),
                "Lease held by another replica"
            );
            return Ok(false);
        }

        if current.holder_identity.as_deref() == Some(self.config.identity.as_str()) {
            desired.acquire_time = current.acquire_time;
            desired.lease_transitions = current.lease_transitions;
        } else {
            desired.lease_transitions = current.lease_transitions + 1;
        }
        desired.resource_version = current.resource_version;

        match self.lock.update(&desired).await {
            Ok(updated) => {
                self.observe(&updated);
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Give up the lease if we still hold it
    pub async fn release(&self) {
        let current = self.observed.lock().as_ref().map(|(record, _)| record.clone());
        let Some(current) = current else {
            return;
        };
        if current.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: RELEASED_LEASE_DURATION,
            acquire_time: Some(now),
            renew_time: Some(now),
            ..current
        };
        match self.lock.update(&released).await {
            Ok(record) => {
                self.observe(&record);
                info!(lease = %self.lock.describe(), "Released leadership lease");
            }
            Err(e) => warn!(error = %e, "Failed to release leadership lease"),
        }
    }

    /// Wait for `delay`, returning `false` if `cancel` fired first
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(
            identity = %self.config.identity,
            lease = %self.lock.describe(),
            "Attempting to acquire leadership lease"
        );
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match tokio::time::timeout(self.config.retry_period, self.try_acquire_or_renew()).await
            {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "Error acquiring leadership lease"),
                Err(_) => warn!("Timed out acquiring leadership lease"),
            }
            if !self.pause(self.config.retry_period, cancel).await {
                return false;
            }
        }
    }

    /// Renew until the deadline; `None` when cancelled
    async fn renew(&self, cancel: &CancellationToken) -> Option<bool> {
        let deadline = Instant::now() + self.config.renew_deadline;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Some(false);
            }
            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => return Some(true),
                Ok(Ok(false)) => warn!("Leadership lease was taken over"),
                Ok(Err(e)) => warn!(error = %e, "Error renewing leadership lease"),
                Err(_) => return Some(false),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.pause(self.config.retry_period.min(remaining), cancel).await {
                return None;
            }
        }
    }

    /// Campaign, lead and step down.
    ///
    /// Returns `Ok(())` when `cancel` fires; the lease is released after
    /// the controller was stopped. Losing the lease while leading returns
    /// [`OperatorError::LeadershipLost`].
    pub async fn run(&self, cancel: &CancellationToken, callbacks: &dyn LeadershipCallbacks) -> Result<()> {
        self.set_state(LeaderState::Candidate);
        if !self.acquire(cancel).await {
            self.set_state(LeaderState::Released);
            return Ok(());
        }

        info!(identity = %self.config.identity, "Acquired leadership");
        self.set_state(LeaderState::Leading);
        callbacks.on_started_leading().await;

        loop {
            if !self.pause(self.config.retry_period, cancel).await {
                break;
            }
            match self.renew(cancel).await {
                Some(true) => debug!("Renewed leadership lease"),
                Some(false) => {
                    warn!(identity = %self.config.identity, "Failed to renew leadership lease in time");
                    self.set_state(LeaderState::Released);
                    callbacks.on_stopped_leading().await;
                    return Err(OperatorError::LeadershipLost(format!(
                        "lease {} not renewed within {:?}",
                        self.lock.describe(),
                        self.config.renew_deadline
                    )));
                }
                None => break,
            }
        }

        info!(identity = %self.config.identity, "Stepping down");
        callbacks.on_stopped_leading().await;
        self.release().await;
        self.set_state(LeaderState::Released);
        Ok(())
    }
}
