//! Resource clients
//!
//! Reads go through reflector stores that are kept fresh by watches and may
//! lag the API server; writes go straight to the API. Both sides are hidden
//! behind small traits so the reconcile logic can run against in-memory
//! fakes in tests.

use crate::crd::{DgraphCluster, DgraphClusterStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// `(namespace, name)` identity of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object, `None` for unnamed or cluster-scoped objects
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cached reads and direct writes for one namespaced resource kind
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Cached lookup by name
    fn cached(&self, namespace: &str, name: &str) -> Option<K>;

    /// Cached objects of a namespace whose labels contain `selector`
    fn cached_list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<K>;

    /// Live read from the API server
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace guarded by the object's `resourceVersion`
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;
}

/// Status writes for DgraphCluster objects
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Write the status sub-resource only
    async fn update_status(&self, key: &ObjectKey, status: &DgraphClusterStatus) -> Result<()>;
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// [`ResourceClient`] backed by a reflector store and the Kubernetes API
pub struct KubeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    client: Client,
    store: Store<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(client: Client, store: Store<K>) -> Self {
        Self { client, store }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<K> {
        self.store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|obj| obj.as_ref().clone())
    }

    fn cached_list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<K> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .filter(|obj| matches_selector(obj.labels(), selector))
            .map(|obj| obj.as_ref().clone())
            .collect()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(OperatorError::from)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(OperatorError::from)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), obj)
            .await
            .map_err(OperatorError::from)
    }
}

/// [`ClusterClient`] writing through the status sub-resource
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn update_status(&self, key: &ObjectKey, status: &DgraphClusterStatus) -> Result<()> {
        let api: Api<DgraphCluster> = Api::namespaced(self.client.clone(), &key.namespace);

        debug!(cluster = %key, phase = ?status.phase, "Updating cluster status");

        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}

/// Watch `api` into a store.
///
/// Returns the store reader and a stream of every object that was applied or
/// deleted. The stream must be polled for the store to make progress; watch
/// errors are logged and retried with backoff.
pub fn reflect<K>(
    api: Api<K>,
    config: watcher::Config,
) -> (Store<K>, impl Stream<Item = Arc<K>> + Send + 'static)
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects()
        .inspect_err(|e| warn!(error = %e, "Watch stream error"))
        .filter_map(|event| async move { event.ok().map(Arc::new) });
    (reader, stream)
}
