//! Ordered component syncers
//!
//! A reconcile pass runs one syncer per Dgraph component, strictly in the
//! order zero, alpha, ratel. Alpha's startup command embeds the DNS name of
//! the first zero, so alpha is never touched before zero has converged, and
//! the chain stops at the first failing component.

mod alpha;
mod ratel;
mod zero;

pub use alpha::AlphaSyncer;
pub use ratel::RatelSyncer;
pub use zero::ZeroSyncer;

use crate::client::ResourceClient;
use crate::crd::{DgraphCluster, DgraphClusterStatus, MembersStatus};
use crate::error::Result;
use crate::resources::Component;
use crate::sync::sync_resource;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Brings one component's children in line with the cluster spec
#[async_trait]
pub trait ComponentSyncer: Send + Sync {
    fn component(&self) -> Component;

    /// Converge the component and record its members into `status`
    async fn sync(&self, cluster: &DgraphCluster, status: &mut DgraphClusterStatus) -> Result<()>;
}

/// Clients for every kind the syncers read or write
#[derive(Clone)]
pub struct ResourceClients {
    pub services: Arc<dyn ResourceClient<Service>>,
    pub statefulsets: Arc<dyn ResourceClient<StatefulSet>>,
    pub deployments: Arc<dyn ResourceClient<Deployment>>,
    /// Read only, for membership
    pub pods: Arc<dyn ResourceClient<Pod>>,
}

/// Syncers run in list order, stopping at the first error
pub struct ManagerChain {
    syncers: Vec<Box<dyn ComponentSyncer>>,
}

impl ManagerChain {
    pub fn new(syncers: Vec<Box<dyn ComponentSyncer>>) -> Self {
        Self { syncers }
    }

    /// The zero, alpha, ratel chain
    pub fn dgraph(clients: ResourceClients) -> Self {
        Self::new(vec![
            Box::new(ZeroSyncer::new(clients.clone())),
            Box::new(AlphaSyncer::new(clients.clone())),
            Box::new(RatelSyncer::new(clients)),
        ])
    }

    pub async fn run(&self, cluster: &DgraphCluster, status: &mut DgraphClusterStatus) -> Result<()> {
        for syncer in &self.syncers {
            let component = syncer.component();
            debug!(component = %component, "Syncing component");

            if let Err(e) = syncer.sync(cluster, status).await {
                warn!(component = %component, error = %e, "Component sync failed");
                metrics::counter!(
                    "dgraph_operator_component_sync_errors_total",
                    "component" => component.as_str()
                )
                .increment(1);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Addressable service, headless service, then the StatefulSet
pub(crate) async fn sync_stateful(
    clients: &ResourceClients,
    namespace: &str,
    service: &Service,
    headless: &Service,
    statefulset: &StatefulSet,
) -> Result<()> {
    sync_resource(clients.services.as_ref(), namespace, service).await?;
    sync_resource(clients.services.as_ref(), namespace, headless).await?;
    sync_resource(clients.statefulsets.as_ref(), namespace, statefulset).await?;
    Ok(())
}

/// Ready and unready pods matching `selector`, names sorted
pub(crate) fn members(
    pods: &dyn ResourceClient<Pod>,
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> MembersStatus {
    let mut status = MembersStatus::default();
    for pod in pods.cached_list(namespace, selector) {
        let Some(name) = pod.metadata.name.clone() else {
            continue;
        };
        if is_pod_ready(&pod) {
            status.ready.push(name);
        } else {
            status.unready.push(name);
        }
    }
    status.ready.sort();
    status.unready.sort();
    status
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::{test_cluster, test_cluster_with_ratel};
    use crate::error::{api_error, OperatorError};
    use crate::testing::{ready_pod, FakeClients, Write};
    use parking_lot::Mutex;

    struct Recording {
        component: Component,
        log: Arc<Mutex<Vec<Component>>>,
        fail: bool,
    }

    #[async_trait]
    impl ComponentSyncer for Recording {
        fn component(&self) -> Component {
            self.component
        }

        async fn sync(&self, _: &DgraphCluster, _: &mut DgraphClusterStatus) -> Result<()> {
            self.log.lock().push(self.component);
            if self.fail {
                return Err(OperatorError::Timeout("boom".to_string()));
            }
            Ok(())
        }
    }

    fn recording_chain(log: &Arc<Mutex<Vec<Component>>>, failing: Option<Component>) -> ManagerChain {
        let syncers = [Component::Zero, Component::Alpha, Component::Ratel]
            .into_iter()
            .map(|component| {
                Box::new(Recording {
                    component,
                    log: log.clone(),
                    fail: failing == Some(component),
                }) as Box<dyn ComponentSyncer>
            })
            .collect();
        ManagerChain::new(syncers)
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recording_chain(&log, None);
        let mut status = DgraphClusterStatus::default();

        chain.run(&test_cluster(), &mut status).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec![Component::Zero, Component::Alpha, Component::Ratel]
        );
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recording_chain(&log, Some(Component::Zero));
        let mut status = DgraphClusterStatus::default();

        assert!(chain.run(&test_cluster(), &mut status).await.is_err());
        assert_eq!(*log.lock(), vec![Component::Zero]);
    }

    #[tokio::test]
    async fn test_first_pass_creates_everything() {
        let fakes = FakeClients::new();
        let chain = ManagerChain::dgraph(fakes.clients());
        let mut status = DgraphClusterStatus::default();

        chain.run(&test_cluster(), &mut status).await.unwrap();
        assert_eq!(fakes.services.writes().len(), 4);
        assert_eq!(fakes.statefulsets.writes().len(), 2);
        assert!(fakes.deployments.writes().is_empty());

        let fakes = FakeClients::new();
        let chain = ManagerChain::dgraph(fakes.clients());
        chain
            .run(&test_cluster_with_ratel(), &mut status)
            .await
            .unwrap();
        assert_eq!(fakes.total_creates(), 8);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let fakes = FakeClients::new();
        let chain = ManagerChain::dgraph(fakes.clients());
        let cluster = test_cluster_with_ratel();
        let mut status = DgraphClusterStatus::default();

        chain.run(&cluster, &mut status).await.unwrap();
        fakes.clear_writes();
        chain.run(&cluster, &mut status).await.unwrap();

        assert_eq!(fakes.total_writes(), 0);
    }

    #[tokio::test]
    async fn test_zero_failure_skips_alpha() {
        let fakes = FakeClients::new();
        fakes
            .statefulsets
            .fail_creates(1, || api_error(500, "InternalError"));
        let chain = ManagerChain::dgraph(fakes.clients());
        let mut status = DgraphClusterStatus::default();

        assert!(chain.run(&test_cluster(), &mut status).await.is_err());

        // Only the two zero services were written
        let services = fakes.services.writes();
        assert_eq!(services.len(), 2);
        assert!(services
            .iter()
            .all(|w| matches!(w, Write::Create(name) if name.contains("-zero"))));
        assert!(fakes.statefulsets.stored("default", "c1-test-cluster-alpha").is_none());
    }

    #[tokio::test]
    async fn test_scale_up_updates_statefulset_once() {
        let fakes = FakeClients::new();
        let chain = ManagerChain::dgraph(fakes.clients());
        let mut cluster = test_cluster();
        let mut status = DgraphClusterStatus::default();

        chain.run(&cluster, &mut status).await.unwrap();
        fakes.clear_writes();

        cluster.spec.zero.replicas = 5;
        chain.run(&cluster, &mut status).await.unwrap();

        assert_eq!(
            fakes.statefulsets.writes(),
            vec![Write::Replace("c1-test-cluster-zero".to_string())]
        );
        assert!(fakes.services.writes().is_empty());

        let sts = fakes
            .statefulsets
            .stored("default", "c1-test-cluster-zero")
            .unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(5));
        // Defaulted by the fake API server on create, absent from the manifest
        assert_eq!(spec.revision_history_limit, Some(10));
    }

    #[tokio::test]
    async fn test_members_recorded() {
        let fakes = FakeClients::new();
        let cluster = test_cluster();
        let builder = crate::resources::ResourceBuilder::new(&cluster).unwrap();
        let labels = builder.labels(Component::Zero);
        fakes.pods.insert(ready_pod("c1-test-cluster-zero-1", &labels, true));
        fakes.pods.insert(ready_pod("c1-test-cluster-zero-0", &labels, true));
        fakes.pods.insert(ready_pod("c1-test-cluster-zero-2", &labels, false));

        let chain = ManagerChain::dgraph(fakes.clients());
        let mut status = DgraphClusterStatus::default();
        chain.run(&cluster, &mut status).await.unwrap();

        assert_eq!(
            status.zero.ready,
            vec!["c1-test-cluster-zero-0", "c1-test-cluster-zero-1"]
        );
        assert_eq!(status.zero.unready, vec!["c1-test-cluster-zero-2"]);
        assert!(status.alpha.ready.is_empty());
    }
}
