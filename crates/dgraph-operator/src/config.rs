//! Operator configuration
//!
//! Settings come from an optional YAML file and are overridden by
//! `DGRAPH_OPERATOR_*` environment variables and command line flags.

use crate::controller::ControllerSettings;
use crate::defaults::{
    CRD_WAIT_POLL_INTERVAL, CRD_WAIT_TIMEOUT, DEFAULT_WORKERS, LEASE_DURATION, LEASE_LOCK_NAME,
    OPERATOR_HOST, OPERATOR_PORT, RENEW_DEADLINE, RESYNC_PERIOD, RETRY_PERIOD,
};
use crate::error::{OperatorError, Result};
use crate::leader::LeaderElectionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Complete operator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Namespace to watch, all namespaces if unset
    pub namespace: Option<String>,

    /// Seconds between full resyncs of every cached cluster
    pub resync_period_secs: u64,

    pub leader_election: LeaderElectionSettings,

    pub crd: CrdSettings,

    pub server: ServerSettings,

    pub log: LogSettings,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            namespace: None,
            resync_period_secs: RESYNC_PERIOD.as_secs(),
            leader_election: LeaderElectionSettings::default(),
            crd: CrdSettings::default(),
            server: ServerSettings::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionSettings {
    pub enabled: bool,
    pub lease_name: String,
    /// Namespace of the lease, `$NAMESPACE` or `default` if unset
    pub lease_namespace: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: LEASE_LOCK_NAME.to_string(),
            lease_namespace: None,
            lease_duration_secs: LEASE_DURATION.as_secs(),
            renew_deadline_secs: RENEW_DEADLINE.as_secs(),
            retry_period_secs: RETRY_PERIOD.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CrdSettings {
    /// Expect the CRD to be installed out of band
    pub skip_creation: bool,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for CrdSettings {
    fn default() -> Self {
        Self {
            skip_creation: false,
            poll_interval_secs: CRD_WAIT_POLL_INTERVAL.as_secs(),
            poll_timeout_secs: CRD_WAIT_TIMEOUT.as_secs(),
        }
    }
}

/// Health and metrics endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: OPERATOR_HOST.to_string(),
            port: OPERATOR_PORT,
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| OperatorError::InvalidConfig(format!("invalid server address: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogSettings {
    /// Level or `tracing` filter directive, e.g. `info,kube=warn`
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Values given on the command line or through the environment
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "DGRAPH_OPERATOR_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "DGRAPH_OPERATOR_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Seconds between full resyncs
    #[arg(long, env = "DGRAPH_OPERATOR_RESYNC_PERIOD", global = true)]
    pub resync_period: Option<u64>,

    /// Enable leader election for high availability
    #[arg(long, env = "DGRAPH_OPERATOR_LEADER_ELECTION", global = true)]
    pub leader_election: Option<bool>,

    #[arg(long, env = "DGRAPH_OPERATOR_LEASE_NAME", global = true)]
    pub lease_name: Option<String>,

    #[arg(long, env = "DGRAPH_OPERATOR_LEASE_NAMESPACE", global = true)]
    pub lease_namespace: Option<String>,

    #[arg(long, env = "DGRAPH_OPERATOR_LEASE_DURATION", global = true)]
    pub lease_duration: Option<u64>,

    #[arg(long, env = "DGRAPH_OPERATOR_RENEW_DEADLINE", global = true)]
    pub renew_deadline: Option<u64>,

    #[arg(long, env = "DGRAPH_OPERATOR_RETRY_PERIOD", global = true)]
    pub retry_period: Option<u64>,

    /// Do not create the CRD, wait for an installed one
    #[arg(long, env = "DGRAPH_OPERATOR_SKIP_CRD", global = true)]
    pub skip_crd: Option<bool>,

    #[arg(long, env = "DGRAPH_OPERATOR_CRD_POLL_INTERVAL", global = true)]
    pub crd_poll_interval: Option<u64>,

    #[arg(long, env = "DGRAPH_OPERATOR_CRD_POLL_TIMEOUT", global = true)]
    pub crd_poll_timeout: Option<u64>,

    /// Health and metrics host
    #[arg(long, env = "DGRAPH_OPERATOR_HOST", global = true)]
    pub host: Option<String>,

    /// Health and metrics port
    #[arg(long, env = "DGRAPH_OPERATOR_PORT", global = true)]
    pub port: Option<u16>,

    /// Log level or filter directive
    #[arg(long, env = "DGRAPH_OPERATOR_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "DGRAPH_OPERATOR_LOG_JSON", global = true)]
    pub log_json: Option<bool>,
}

impl OperatorConfig {
    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Layer the given overrides on top of this configuration
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        set(&mut self.workers, &overrides.workers);
        if let Some(ns) = &overrides.namespace {
            self.namespace = Some(ns.clone()).filter(|ns| !ns.is_empty());
        }
        set(&mut self.resync_period_secs, &overrides.resync_period);

        let election = &mut self.leader_election;
        set(&mut election.enabled, &overrides.leader_election);
        set(&mut election.lease_name, &overrides.lease_name);
        if overrides.lease_namespace.is_some() {
            election.lease_namespace = overrides.lease_namespace.clone();
        }
        set(&mut election.lease_duration_secs, &overrides.lease_duration);
        set(&mut election.renew_deadline_secs, &overrides.renew_deadline);
        set(&mut election.retry_period_secs, &overrides.retry_period);

        set(&mut self.crd.skip_creation, &overrides.skip_crd);
        set(&mut self.crd.poll_interval_secs, &overrides.crd_poll_interval);
        set(&mut self.crd.poll_timeout_secs, &overrides.crd_poll_timeout);

        set(&mut self.server.host, &overrides.host);
        set(&mut self.server.port, &overrides.port);

        set(&mut self.log.level, &overrides.log_level);
        set(&mut self.log.json, &overrides.log_json);
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.resync_period_secs == 0 {
            return Err(OperatorError::InvalidConfig(
                "resync period must be positive".to_string(),
            ));
        }
        if self.crd.poll_interval_secs == 0 || self.crd.poll_timeout_secs == 0 {
            return Err(OperatorError::InvalidConfig(
                "CRD poll interval and timeout must be positive".to_string(),
            ));
        }
        self.server.addr()?;
        if self.leader_election.enabled {
            self.election_config(String::from("validate")).validate()?;
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            resync_period: Duration::from_secs(self.resync_period_secs),
            namespace: self.namespace.clone(),
        }
    }

    pub fn election_config(&self, identity: String) -> LeaderElectionConfig {
        let election = &self.leader_election;
        LeaderElectionConfig {
            identity,
            lease_duration: Duration::from_secs(election.lease_duration_secs),
            renew_deadline: Duration::from_secs(election.renew_deadline_secs),
            retry_period: Duration::from_secs(election.retry_period_secs),
        }
    }

    /// Namespace holding the lease
    pub fn lease_namespace(&self) -> String {
        self.leader_election
            .lease_namespace
            .clone()
            .or_else(|| std::env::var("NAMESPACE").ok())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn crd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.crd.poll_interval_secs)
    }

    pub fn crd_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.crd.poll_timeout_secs)
    }
}
