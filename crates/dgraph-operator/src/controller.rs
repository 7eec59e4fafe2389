//! DgraphCluster Controller
//!
//! Built on the kube-runtime [`Controller`]: changes to clusters and to the
//! Services, StatefulSets, Deployments and Pods they own are collapsed into
//! one reconcile request per cluster, and a cluster is never reconciled by
//! two workers at once. Each reconcile runs the manager chain against the
//! cached view of the children, then writes the derived status back if it
//! changed. Failed clusters are requeued with per-cluster backoff.

use crate::client::{reflect, ClusterClient, KubeClusterClient, KubeResourceClient, ObjectKey};
use crate::crd::DgraphCluster;
use crate::defaults::{
    DEFAULT_WORKERS, ERROR_REQUEUE_BASE, ERROR_REQUEUE_MAX, OPERATOR_NAME, RESYNC_PERIOD,
};
use crate::error::{OperatorError, Result};
use crate::manager::{ManagerChain, ResourceClients};
use crate::resources::{headless_name, member_name, Component, LABEL_INSTANCE, LABEL_MANAGED_BY};
use crate::status::derive_status;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Longest name Kubernetes accepts for a DNS label
const MAX_DNS_LABEL_LENGTH: usize = 63;

/// Knobs of the reconcile loop
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Number of concurrent reconciles
    pub workers: usize,
    /// Interval at which every cached cluster is reconciled again
    pub resync_period: Duration,
    /// Namespace to watch, all namespaces if unset
    pub namespace: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_period: RESYNC_PERIOD,
            namespace: None,
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for status writes
    pub status_updates: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("dgraph_operator_reconciliations_total"),
            errors: metrics::counter!("dgraph_operator_reconciliation_errors_total"),
            status_updates: metrics::counter!("dgraph_operator_status_updates_total"),
            duration: metrics::histogram!("dgraph_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    clusters: Arc<dyn ClusterClient>,
    chain: ManagerChain,
    metrics: ControllerMetrics,
    /// Per-cluster error retry counts for exponential backoff
    error_counts: DashMap<ObjectKey, u32>,
    /// Delay for errors that retrying soon will not fix
    resync_period: Duration,
}

impl ControllerContext {
    pub fn new(
        clusters: Arc<dyn ClusterClient>,
        chain: ManagerChain,
        settings: &ControllerSettings,
    ) -> Self {
        Self {
            clusters,
            chain,
            metrics: ControllerMetrics::new(),
            error_counts: DashMap::new(),
            resync_period: settings.resync_period,
        }
    }

    /// Converge the children of `cluster` and persist the derived status.
    ///
    /// A chain failure is returned after the `Failed` status was written;
    /// otherwise the status write error, if any, is returned.
    pub async fn reconcile_cluster(&self, cluster: &DgraphCluster) -> Result<()> {
        let key = ObjectKey::from_resource(cluster).ok_or_else(|| {
            OperatorError::ValidationError("DgraphCluster must be namespaced".to_string())
        })?;

        let start = std::time::Instant::now();
        self.metrics.reconciliations.increment(1);
        info!("Reconciling DgraphCluster");

        let mut working = cluster.status.clone().unwrap_or_default();
        let result = match validate_cluster(cluster) {
            Ok(()) => self.chain.run(cluster, &mut working).await,
            Err(e) => Err(e),
        };

        let status = derive_status(cluster, working, &result);
        let write = if cluster.status.as_ref() != Some(&status) {
            self.metrics.status_updates.increment(1);
            self.clusters.update_status(&key, &status).await
        } else {
            debug!("Status unchanged");
            Ok(())
        };

        self.metrics.duration.record(start.elapsed().as_secs_f64());

        if let Err(e) = result {
            self.metrics.errors.increment(1);
            if let Err(write_err) = write {
                warn!(error = %write_err, "Failed to record failed status");
            }
            return Err(e);
        }
        write.inspect_err(|_| self.metrics.errors.increment(1))?;

        info!(phase = ?status.phase, "Reconciliation complete");
        Ok(())
    }
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
async fn reconcile(cluster: Arc<DgraphCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    ctx.reconcile_cluster(&cluster).await?;

    if let Some(key) = ObjectKey::from_resource(cluster.as_ref()) {
        ctx.error_counts.remove(&key);
    }
    Ok(Action::await_change())
}

/// Requeue delay after `retries` consecutive failures: 5ms doubling up to 1000s
fn backoff_delay(retries: u32) -> Duration {
    ERROR_REQUEUE_BASE
        .saturating_mul(2u32.saturating_pow(retries.saturating_sub(1)))
        .min(ERROR_REQUEUE_MAX)
}

/// Error policy for the controller, exponential backoff per cluster.
///
/// Errors that will not go away on their own (invalid spec, serialization)
/// are retried at the resync period instead.
fn error_policy(
    cluster: Arc<DgraphCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = ObjectKey::from_resource(cluster.as_ref())
        .unwrap_or_else(|| ObjectKey::new("", cluster.name_any()));
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    };

    let delay = if error.is_retryable() {
        backoff_delay(retries)
    } else {
        ctx.resync_period
    };

    warn!(
        cluster = %key,
        error = %error,
        retry = retries,
        delay_ms = delay.as_millis() as u64,
        "Reconciliation error, will retry"
    );

    Action::requeue(delay)
}

/// Validate the spec beyond what the schema enforces
fn validate_cluster(cluster: &DgraphCluster) -> Result<()> {
    let name = cluster.name_any();

    if let Err(errors) = cluster.spec.validate() {
        let error_msg = errors.to_string().replace('\n', "; ");
        warn!(name = %name, errors = %error_msg, "Cluster spec validation failed");
        return Err(OperatorError::ValidationError(error_msg));
    }

    // Headless names are the longest child names and end up in pod DNS
    for component in [Component::Zero, Component::Alpha, Component::Ratel] {
        let headless = headless_name(&member_name(
            &cluster.spec.cluster_id,
            &name,
            component.as_str(),
        ));
        if headless.len() > MAX_DNS_LABEL_LENGTH {
            return Err(OperatorError::ValidationError(format!(
                "child name '{}' exceeds {} characters; shorten clusterID or the cluster name",
                headless, MAX_DNS_LABEL_LENGTH
            )));
        }
    }

    Ok(())
}

/// Pods are owned by a workload, which in turn is owned by the cluster
fn pod_cluster_ref(pod: &Pod, clients: &ResourceClients) -> Option<ObjectRef<DgraphCluster>> {
    let namespace = pod.namespace()?;
    let member = pod.labels().get(LABEL_INSTANCE)?;

    let owners = match clients.statefulsets.cached(&namespace, member) {
        Some(sts) => sts.metadata.owner_references,
        None => {
            clients
                .deployments
                .cached(&namespace, member)?
                .metadata
                .owner_references
        }
    }?;

    owners
        .iter()
        .find(|owner| {
            owner.controller == Some(true)
                && owner.kind == DgraphCluster::kind(&())
                && owner.api_version == DgraphCluster::api_version(&())
        })
        .map(|owner| ObjectRef::new(&owner.name).within(&namespace))
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// A tick every `period`, the first one after a full period
fn resync_ticks(period: Duration) -> impl Stream<Item = ()> + Send + Sync + 'static {
    stream::unfold((), move |()| async move {
        tokio::time::sleep(period).await;
        Some(((), ()))
    })
}

/// Run `controller` until `cancel` fires; running reconciles are allowed to
/// finish
async fn drive(
    controller: Controller<DgraphCluster>,
    ctx: Arc<ControllerContext>,
    settings: ControllerSettings,
    cancel: CancellationToken,
) {
    let concurrency = u16::try_from(settings.workers.max(1)).unwrap_or(u16::MAX);

    controller
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_all_on(resync_ticks(settings.resync_period))
        .graceful_shutdown_on(cancel.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(cluster = %obj, ?action, "Reconciliation completed");
                }
                Err(controller::Error::ReconcilerFailed(_, obj)) => {
                    debug!(cluster = %obj, "Reconciliation failed, requeued");
                }
                Err(e) => {
                    warn!(error = %e, "Controller error");
                }
            }
        })
        .await;

    info!("DgraphCluster controller stopped");
}

/// Start the DgraphCluster controller against the cluster behind `client`
pub async fn run_controller(
    client: Client,
    settings: ControllerSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let ns = settings.namespace.as_deref();

    info!(
        namespace = ns.unwrap_or("all"),
        workers = settings.workers,
        "Starting DgraphCluster controller"
    );

    let owned = watcher::Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, OPERATOR_NAME));

    // Caches the syncers read children from
    let (service_store, services) = reflect(scoped_api::<Service>(&client, ns), owned.clone());
    let (sts_store, statefulsets) = reflect(scoped_api::<StatefulSet>(&client, ns), owned.clone());
    let (deployment_store, deployments) =
        reflect(scoped_api::<Deployment>(&client, ns), owned.clone());
    let (pod_store, pods) = reflect(scoped_api::<Pod>(&client, ns), owned.clone());

    let mut caches = JoinSet::new();
    caches.spawn(services.for_each(|_| futures::future::ready(())));
    caches.spawn(statefulsets.for_each(|_| futures::future::ready(())));
    caches.spawn(deployments.for_each(|_| futures::future::ready(())));
    caches.spawn(pods.for_each(|_| futures::future::ready(())));

    let synced = async {
        let (a, b, c, d) = futures::join!(
            service_store.wait_until_ready(),
            sts_store.wait_until_ready(),
            deployment_store.wait_until_ready(),
            pod_store.wait_until_ready(),
        );
        [a, b, c, d].iter().all(|r| r.is_ok())
    };
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        synced = synced => {
            if !synced {
                warn!("A watch stopped before its cache synced");
            }
        }
    }
    info!("Caches synced, starting reconciles");

    let clients = ResourceClients {
        services: Arc::new(KubeResourceClient::new(client.clone(), service_store)),
        statefulsets: Arc::new(KubeResourceClient::new(client.clone(), sts_store)),
        deployments: Arc::new(KubeResourceClient::new(client.clone(), deployment_store)),
        pods: Arc::new(KubeResourceClient::new(client.clone(), pod_store)),
    };

    let pod_clients = clients.clone();
    let controller = Controller::new(
        scoped_api::<DgraphCluster>(&client, ns),
        watcher::Config::default(),
    )
    .owns(scoped_api::<Service>(&client, ns), owned.clone())
    .owns(scoped_api::<StatefulSet>(&client, ns), owned.clone())
    .owns(scoped_api::<Deployment>(&client, ns), owned.clone())
    .watches(scoped_api::<Pod>(&client, ns), owned, move |pod| {
        pod_cluster_ref(&pod, &pod_clients)
    });

    let ctx = Arc::new(ControllerContext::new(
        Arc::new(KubeClusterClient::new(client)),
        ManagerChain::dgraph(clients),
        &settings,
    ));

    drive(controller, ctx, settings, cancel).await;
    caches.shutdown().await;

    Ok(())
}
