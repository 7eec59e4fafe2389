//! In-memory stand-ins for the API server used by unit tests

use crate::client::{ClusterClient, ObjectKey, ResourceClient};
use crate::crd::DgraphClusterStatus;
use crate::crd_gate::CrdApi;
use crate::error::{api_error, OperatorError, Result};
use crate::leader::{LeaseLock, LeaseRecord};
use crate::manager::ResourceClients;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A write observed by a fake client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Create(String),
    Replace(String),
}

type ErrorFn = fn() -> OperatorError;

/// Fields the API server fills in on create
fn apply_server_defaults(kind: &str, value: &mut Value, serial: u64) {
    value["metadata"]["uid"] = Value::String(format!("uid-{}", serial));
    match kind {
        "Service" if value["spec"]["clusterIP"].is_null() => {
            value["spec"]["clusterIP"] = Value::String(format!("10.96.0.{}", serial % 250));
        }
        "StatefulSet" if value["spec"]["revisionHistoryLimit"].is_null() => {
            value["spec"]["revisionHistoryLimit"] = Value::from(10);
        }
        _ => {}
    }
}

/// Single-kind object store with write recording and error injection.
///
/// The cache and the API are the same map, so cached reads are never stale.
pub struct FakeResourceClient<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    writes: Mutex<Vec<Write>>,
    create_failures: Mutex<Option<(usize, ErrorFn)>>,
    replace_failures: Mutex<Option<(usize, ErrorFn)>>,
    live_reads: AtomicUsize,
    serial: AtomicU64,
}

impl<K> FakeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            create_failures: Mutex::new(None),
            replace_failures: Mutex::new(None),
            live_reads: AtomicUsize::new(0),
            serial: AtomicU64::new(0),
        }
    }

    /// Store an object without recording a write
    pub fn insert(&self, obj: K) {
        let meta = obj.meta();
        let key = (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        );
        self.objects.lock().insert(key, obj);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    pub fn live_reads(&self) -> usize {
        self.live_reads.load(Ordering::SeqCst)
    }

    /// Fail the next `times` creates with `err()`
    pub fn fail_creates(&self, times: usize, err: ErrorFn) {
        *self.create_failures.lock() = Some((times, err));
    }

    /// Fail the next `times` replaces with `err()`
    pub fn fail_replaces(&self, times: usize, err: ErrorFn) {
        *self.replace_failures.lock() = Some((times, err));
    }

    fn injected(slot: &Mutex<Option<(usize, ErrorFn)>>) -> Option<OperatorError> {
        let mut slot = slot.lock();
        match slot.as_mut() {
            Some((remaining, err)) if *remaining > 0 => {
                *remaining -= 1;
                Some(err())
            }
            _ => None,
        }
    }

    fn next_version(&self) -> String {
        (self.serial.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl<K> Default for FakeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> ResourceClient<K> for FakeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<K> {
        self.stored(namespace, name)
    }

    fn cached_list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<K> {
        self.objects
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| {
                let labels = obj.meta().labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.live_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.stored(namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        if let Some(err) = Self::injected(&self.create_failures) {
            return Err(err);
        }
        let name = obj.meta().name.clone().unwrap_or_default();
        if self.stored(namespace, &name).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }

        let version = self.next_version();
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["resourceVersion"] = Value::String(version.clone());
        apply_server_defaults(&K::kind(&()), &mut value, version.parse().unwrap_or(0));
        let created: K = serde_json::from_value(value)?;

        self.insert(created.clone());
        self.writes.lock().push(Write::Create(name));
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        if let Some(err) = Self::injected(&self.replace_failures) {
            return Err(err);
        }
        let Some(current) = self.stored(namespace, name) else {
            return Err(api_error(404, "NotFound"));
        };
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(api_error(409, "Conflict"));
        }

        let mut replaced = obj.clone();
        replaced.meta_mut().resource_version = Some(self.next_version());
        self.insert(replaced.clone());
        self.writes.lock().push(Write::Replace(name.to_string()));
        Ok(replaced)
    }
}

/// One fake client per kind the syncers use
pub struct FakeClients {
    pub services: Arc<FakeResourceClient<k8s_openapi::api::core::v1::Service>>,
    pub statefulsets: Arc<FakeResourceClient<k8s_openapi::api::apps::v1::StatefulSet>>,
    pub deployments: Arc<FakeResourceClient<k8s_openapi::api::apps::v1::Deployment>>,
    pub pods: Arc<FakeResourceClient<Pod>>,
}

impl FakeClients {
    pub fn new() -> Self {
        Self {
            services: Arc::new(FakeResourceClient::new()),
            statefulsets: Arc::new(FakeResourceClient::new()),
            deployments: Arc::new(FakeResourceClient::new()),
            pods: Arc::new(FakeResourceClient::new()),
        }
    }

    pub fn clients(&self) -> ResourceClients {
        ResourceClients {
            services: self.services.clone(),
            statefulsets: self.statefulsets.clone(),
            deployments: self.deployments.clone(),
            pods: self.pods.clone(),
        }
    }

    fn all_writes(&self) -> Vec<Write> {
        let mut writes = self.services.writes();
        writes.extend(self.statefulsets.writes());
        writes.extend(self.deployments.writes());
        writes
    }

    pub fn total_writes(&self) -> usize {
        self.all_writes().len()
    }

    pub fn total_creates(&self) -> usize {
        self.all_writes()
            .iter()
            .filter(|w| matches!(w, Write::Create(_)))
            .count()
    }

    pub fn clear_writes(&self) {
        self.services.clear_writes();
        self.statefulsets.clear_writes();
        self.deployments.clear_writes();
    }
}

/// A pod in the default namespace with the given readiness
pub fn ready_pod(name: &str, labels: &BTreeMap<String, String>, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Status sub-resource recording every write
#[derive(Default)]
pub struct FakeClusterClient {
    status_writes: Mutex<Vec<(ObjectKey, DgraphClusterStatus)>>,
    fail_status: AtomicBool,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_writes(&self) -> Vec<DgraphClusterStatus> {
        self.status_writes
            .lock()
            .iter()
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn written_keys(&self) -> Vec<ObjectKey> {
        self.status_writes
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn update_status(&self, key: &ObjectKey, status: &DgraphClusterStatus) -> Result<()> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError"));
        }
        self.status_writes.lock().push((key.clone(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct LeaseState {
    record: Option<LeaseRecord>,
    version: u64,
}

/// Shared in-memory lease with compare-and-swap updates
#[derive(Clone, Default)]
pub struct FakeLeaseLock {
    state: Arc<Mutex<LeaseState>>,
    failing: Arc<AtomicBool>,
}

impl FakeLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.state.lock().record.clone()
    }

    /// Make every call fail, as if the API server were unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for FakeLeaseLock {
    fn describe(&self) -> String {
        "default/test-lease".to_string()
    }

    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check()?;
        Ok(self.state.lock().record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        self.check()?;
        let mut state = self.state.lock();
        if state.record.is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.version += 1;
        let stored = LeaseRecord {
            resource_version: Some(state.version.to_string()),
            ..record.clone()
        };
        state.record = Some(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord> {
        self.check()?;
        let mut state = self.state.lock();
        let current = state
            .record
            .as_ref()
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if current.resource_version != record.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        state.version += 1;
        let stored = LeaseRecord {
            resource_version: Some(state.version.to_string()),
            ..record.clone()
        };
        state.record = Some(stored.clone());
        Ok(stored)
    }
}

/// How the fake API server treats a stored CRD
#[derive(Debug, Clone, Copy)]
pub enum CrdBehavior {
    /// Established once it was read this many times
    EstablishAfter(usize),
    /// Names rejected as conflicting
    NamesRejected,
    /// Never established
    Never,
}

#[derive(Default)]
struct CrdState {
    crd: Option<CustomResourceDefinition>,
    reads: usize,
    creates: usize,
    deleted: bool,
    race: bool,
}

#[derive(Clone)]
pub struct FakeCrdApi {
    behavior: CrdBehavior,
    state: Arc<Mutex<CrdState>>,
}

impl FakeCrdApi {
    pub fn new(behavior: CrdBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(Mutex::new(CrdState::default())),
        }
    }

    /// Pretend the CRD was installed out of band
    pub fn install(&self, crd: &CustomResourceDefinition) {
        self.state.lock().crd = Some(crd.clone());
    }

    /// Another replica creates the CRD right before our create call
    pub fn race_on_create(&self) {
        self.state.lock().race = true;
    }

    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    pub fn deleted(&self) -> bool {
        self.state.lock().deleted
    }

    fn conditions(&self, reads: usize) -> Vec<CustomResourceDefinitionCondition> {
        let condition = |type_: &str, status: &str| CustomResourceDefinitionCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            message: Some(format!("{} is {}", type_, status)),
            ..Default::default()
        };
        match self.behavior {
            CrdBehavior::EstablishAfter(n) if reads >= n => vec![
                condition("NamesAccepted", "True"),
                condition("Established", "True"),
            ],
            CrdBehavior::NamesRejected => vec![
                condition("NamesAccepted", "False"),
                condition("Established", "False"),
            ],
            _ => vec![condition("Established", "False")],
        }
    }
}

#[async_trait]
impl CrdApi for FakeCrdApi {
    async fn get(&self, _name: &str) -> Result<Option<CustomResourceDefinition>> {
        let mut state = self.state.lock();
        state.reads += 1;
        let reads = state.reads;
        Ok(state.crd.clone().map(|mut crd| {
            crd.status = Some(CustomResourceDefinitionStatus {
                conditions: Some(self.conditions(reads)),
                ..Default::default()
            });
            crd
        }))
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        let mut state = self.state.lock();
        if state.race {
            state.race = false;
            state.crd = Some(crd.clone());
            return Err(api_error(409, "AlreadyExists"));
        }
        if state.crd.is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.creates += 1;
        state.crd = Some(crd.clone());
        Ok(crd.clone())
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.crd = None;
        state.deleted = true;
        Ok(())
    }
}
