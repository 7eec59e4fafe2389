//! CRD readiness gate
//!
//! The controller cannot watch DgraphCluster objects before the API server
//! serves the type, so startup blocks until the definition reports
//! `Established`.

use crate::defaults::{CRD_WAIT_POLL_INTERVAL, CRD_WAIT_TIMEOUT};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition,
};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// CustomResourceDefinition access
#[async_trait]
pub trait CrdApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition>;

    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct KubeCrdApi {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdApi {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdApi for KubeCrdApi {
    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        Ok(self.api.create(&PostParams::default(), crd).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

fn condition<'a>(
    crd: &'a CustomResourceDefinition,
    type_: &str,
) -> Option<&'a CustomResourceDefinitionCondition> {
    crd.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

/// Creates the CRD if asked to and waits until it is established
pub struct CrdGate {
    api: Box<dyn CrdApi>,
    poll_interval: Duration,
    timeout: Duration,
}

impl CrdGate {
    pub fn new(api: Box<dyn CrdApi>) -> Self {
        Self {
            api,
            poll_interval: CRD_WAIT_POLL_INTERVAL,
            timeout: CRD_WAIT_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Make sure `crd` is served.
    ///
    /// With `create` set the definition is created when absent, and a
    /// definition created here is deleted again if it never becomes
    /// established. Without `create` the definition is expected to be
    /// installed out of band: failures are only logged. Returns `Ok(())`
    /// without waiting further once `cancel` fires.
    pub async fn ensure(
        &self,
        crd: &CustomResourceDefinition,
        create: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = crd.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig("CustomResourceDefinition without a name".to_string())
        })?;

        let mut created = false;
        if create {
            created = self.create_if_absent(&name, crd).await?;
        } else {
            info!(crd = %name, "CRD creation disabled, waiting for an installed definition");
        }

        match self.wait_established(&name, cancel).await {
            Ok(true) => {
                info!(crd = %name, "CRD established");
                Ok(())
            }
            Ok(false) => {
                info!(crd = %name, "Stopped waiting for CRD");
                Ok(())
            }
            Err(e) if !create => {
                warn!(crd = %name, error = %e, "CRD not confirmed as established, continuing");
                Ok(())
            }
            Err(e @ OperatorError::Timeout(_)) => {
                if created {
                    if let Err(delete_err) = self.api.delete(&name).await {
                        warn!(crd = %name, error = %delete_err, "Failed to delete unestablished CRD");
                    } else {
                        info!(crd = %name, "Deleted unestablished CRD");
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns whether this call created the definition
    async fn create_if_absent(&self, name: &str, crd: &CustomResourceDefinition) -> Result<bool> {
        if self.api.get(name).await?.is_some() {
            info!(crd = %name, "CRD already exists");
            return Ok(false);
        }

        match self.api.create(crd).await {
            Ok(_) => {
                info!(crd = %name, "Created CRD");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                info!(crd = %name, "CRD created concurrently by another replica");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// `Ok(false)` when cancelled before the definition was established
    async fn wait_established(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.api.get(name).await {
                Ok(Some(crd)) => {
                    if condition(&crd, "Established").is_some_and(|c| c.status == "True") {
                        return Ok(true);
                    }
                    if let Some(names) = condition(&crd, "NamesAccepted") {
                        if names.status == "False" {
                            return Err(OperatorError::NameConflict {
                                name: name.to_string(),
                                message: names.message.clone().unwrap_or_default(),
                            });
                        }
                    }
                    debug!(crd = %name, "CRD not established yet");
                }
                Ok(None) => debug!(crd = %name, "CRD not found yet"),
                Err(e) => warn!(crd = %name, error = %e, "Error reading CRD"),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(OperatorError::Timeout(format!(
                    "CRD {} not established within {:?}",
                    name, self.timeout
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }
}
