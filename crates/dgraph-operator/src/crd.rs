//! Custom Resource Definitions for the Dgraph Kubernetes Operator
//!
//! This module defines the `DgraphCluster` CRD that represents a Dgraph
//! cluster (zero, alpha and an optional ratel UI) in Kubernetes.

use crate::defaults::{DEFAULT_BASE_IMAGE, LRU_MB_VALUE, MIN_LRU_MB_VALUE};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{CustomResource, CustomResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Label carried by the generated CRD to track its schema revision
pub const CRD_SCHEMA_VERSION_LABEL: &str = "io.dgraph.k8s.crd.schema.version";
pub const CRD_SCHEMA_VERSION: &str = "1.0.0";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E|m)?$").unwrap());

/// Regex for validating RFC 1123 labels
static LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate the cluster identifier, which prefixes every child object name
fn validate_cluster_id(value: &str) -> Result<(), ValidationError> {
    if !LABEL_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_cluster_id").with_message(
            format!("'{}' is not a valid cluster ID (RFC 1123 label)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference (without tag)
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty inherits the cluster-level image
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate annotations map
fn validate_annotations(annotations: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if annotations.len() > 50 {
        return Err(ValidationError::new("too_many_annotations")
            .with_message("maximum 50 annotations allowed".into()));
    }
    for (key, value) in annotations {
        if key.len() > 253 {
            return Err(ValidationError::new("annotation_key_too_long")
                .with_message(format!("annotation key '{}' exceeds 253 characters", key).into()));
        }
        if value.len() > 262144 {
            return Err(ValidationError::new("annotation_value_too_long")
                .with_message(format!("annotation '{}' value exceeds 256KB", key).into()));
        }
    }
    Ok(())
}

/// Validate persistent storage requests
fn validate_storage_requests(requests: &BTreeMap<String, Quantity>) -> Result<(), ValidationError> {
    if !requests.contains_key("storage") {
        return Err(ValidationError::new("missing_storage_request")
            .with_message("persistentStorage.requests must contain 'storage'".into()));
    }
    for (key, quantity) in requests {
        if !QUANTITY_REGEX.is_match(&quantity.0) {
            return Err(ValidationError::new("invalid_quantity").with_message(
                format!("'{}' is not a valid Kubernetes quantity for {}", quantity.0, key).into(),
            ));
        }
    }
    Ok(())
}

/// DgraphCluster custom resource definition
///
/// Represents a Dgraph cluster deployment made of zero (cluster
/// coordination), alpha (data serving) and an optional ratel UI.
/// Component settings left empty inherit the cluster-level values.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "dgraph.io",
    version = "v1alpha1",
    kind = "DgraphCluster",
    plural = "dgraphclusters",
    shortname = "dc",
    namespaced,
    status = "DgraphClusterStatus",
    printcolumn = r#"{"name":"ClusterID", "type":"string", "jsonPath":".spec.clusterID"}"#,
    printcolumn = r#"{"name":"Zeros", "type":"integer", "jsonPath":".spec.zero.replicas"}"#,
    printcolumn = r#"{"name":"Alphas", "type":"integer", "jsonPath":".spec.alpha.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DgraphClusterSpec {
    /// Unique ID of the dgraph cluster deployment
    #[serde(rename = "clusterID")]
    #[validate(length(min = 1, max = 64, message = "clusterID must be 1-64 characters"))]
    #[validate(custom(function = "validate_cluster_id"))]
    pub cluster_id: String,

    /// Dgraph zero (cluster coordination) configuration
    #[validate(nested)]
    pub zero: ZeroClusterSpec,

    /// Dgraph alpha (data serving) configuration
    #[validate(nested)]
    pub alpha: AlphaClusterSpec,

    /// Dgraph ratel UI configuration, skipped when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub ratel: Option<RatelSpec>,

    /// Base image (without tag) for every component
    #[serde(default = "default_base_image")]
    #[validate(custom(function = "validate_image"))]
    pub base_image: String,

    /// Dgraph version, used as the image tag
    #[validate(length(min = 1, max = 128, message = "version must be 1-128 characters"))]
    pub version: String,

    /// Service type for the component services (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Image pull policy for every component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: Option<String>,

    /// Annotations merged into every component's pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,

    /// Resource requirements for every component container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Settings shared by every component, each one overriding the cluster level
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub base_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 128, message = "version must be 1-128 characters"))]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: Option<String>,

    /// Merged with the cluster-level annotations; component keys win
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom(function = "validate_annotations"))]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Persistent storage for a stateful component
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStorageSpec {
    /// Storage class for the volume claims (empty uses the cluster default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Resource requests of the volume claims, must contain `storage`
    #[serde(default)]
    #[validate(custom(function = "validate_storage_requests"))]
    pub requests: BTreeMap<String, Quantity>,
}

/// Dgraph zero configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ZeroClusterSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub common: ComponentSpec,

    /// Number of zero replicas (1-15)
    #[validate(range(min = 1, max = 15, message = "zero replicas must be between 1 and 15"))]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub persistent_storage: Option<PersistentStorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ZeroConfig>,
}

/// Dgraph alpha configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AlphaClusterSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub common: ComponentSpec,

    /// Number of alpha replicas (1-100)
    #[validate(range(min = 1, max = 100, message = "alpha replicas must be between 1 and 100"))]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub persistent_storage: Option<PersistentStorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<AlphaConfig>,
}

/// Dgraph ratel (UI) configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RatelSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub common: ComponentSpec,

    /// Number of ratel replicas (1-10)
    #[validate(range(min = 1, max = 10, message = "ratel replicas must be between 1 and 10"))]
    pub replicas: i32,
}

/// Configuration passed to dgraph zero
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZeroConfig {
    /// Max number of replicas per data shard, defaults to the zero replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_replica_count: Option<i32>,

    /// Jaeger collector URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jaeger_collector: Option<String>,
}

/// Configuration passed to dgraph alpha
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlphaConfig {
    /// Value of the `--lru_mb` flag
    #[serde(rename = "lruMB", default, skip_serializing_if = "Option::is_none")]
    pub lru_mb: Option<i32>,

    /// Jaeger collector URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jaeger_collector: Option<String>,
}

/// Component settings after cluster-level inheritance has been applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedComponent {
    pub base_image: String,
    pub version: String,
    pub service_type: String,
    pub image_pull_policy: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub resources: Option<ResourceRequirements>,
}

impl ResolvedComponent {
    /// Full container image (`baseImage:version`)
    pub fn image(&self) -> String {
        format!("{}:{}", self.base_image, self.version)
    }
}

/// Map a user supplied service type onto the supported set
pub fn resolve_service_type(service_type: &str) -> &'static str {
    match service_type {
        "NodePort" => "NodePort",
        "LoadBalancer" => "LoadBalancer",
        _ => "ClusterIP",
    }
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.is_empty())
}

impl ComponentSpec {
    /// Apply cluster-level defaults to the fields this component leaves empty
    pub fn resolve(&self, cluster: &DgraphClusterSpec) -> ResolvedComponent {
        let base_image = non_empty(&self.base_image)
            .cloned()
            .unwrap_or_else(|| cluster.base_image.clone());
        let version = non_empty(&self.version)
            .cloned()
            .unwrap_or_else(|| cluster.version.clone());
        let service_type = non_empty(&self.service_type)
            .or(non_empty(&cluster.service_type))
            .map(|s| resolve_service_type(s))
            .unwrap_or("ClusterIP")
            .to_string();
        let image_pull_policy = non_empty(&self.image_pull_policy)
            .or(non_empty(&cluster.image_pull_policy))
            .cloned();

        let mut annotations = cluster.annotations.clone();
        annotations.extend(self.annotations.clone());

        ResolvedComponent {
            base_image,
            version,
            service_type,
            image_pull_policy,
            annotations,
            resources: self.resources.clone().or_else(|| cluster.resources.clone()),
        }
    }
}

impl ZeroClusterSpec {
    /// Shard replica count passed to `dgraph zero --replicas`
    pub fn shard_replica_count(&self) -> i32 {
        self.config
            .as_ref()
            .and_then(|c| c.shard_replica_count)
            .filter(|count| *count > 0)
            .unwrap_or(self.replicas)
    }

    pub fn jaeger_collector(&self) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.jaeger_collector.as_deref())
            .filter(|url| !url.is_empty())
    }
}

impl AlphaClusterSpec {
    /// `--lru_mb` for alpha, raised to the default when below the minimum
    pub fn lru_mb(&self) -> i32 {
        match self.config.as_ref().and_then(|c| c.lru_mb) {
            Some(lru) if lru >= MIN_LRU_MB_VALUE => lru,
            _ => LRU_MB_VALUE,
        }
    }

    pub fn jaeger_collector(&self) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.jaeger_collector.as_deref())
            .filter(|url| !url.is_empty())
    }
}

impl DgraphClusterSpec {
    pub fn zero_component(&self) -> ResolvedComponent {
        self.zero.common.resolve(self)
    }

    pub fn alpha_component(&self) -> ResolvedComponent {
        self.alpha.common.resolve(self)
    }

    /// Resolved ratel settings, `None` when ratel is not configured
    pub fn ratel_component(&self) -> Option<ResolvedComponent> {
        self.ratel.as_ref().map(|ratel| ratel.common.resolve(self))
    }
}

/// Ready and unready pod names of one component
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MembersStatus {
    #[serde(default)]
    pub ready: Vec<String>,

    #[serde(default)]
    pub unready: Vec<String>,
}

impl MembersStatus {
    pub fn ready_count(&self) -> i32 {
        i32::try_from(self.ready.len()).unwrap_or(i32::MAX)
    }
}

/// Status of a DgraphCluster resource
///
/// Holds no timestamps so that two statuses describing the same
/// observed state compare equal.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DgraphClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Cluster ID the children were created for
    #[serde(rename = "clusterID")]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub zero: MembersStatus,

    #[serde(default)]
    pub alpha: MembersStatus,

    #[serde(default)]
    pub ratel: MembersStatus,

    /// Version every member runs once the cluster is Running
    pub current_version: Option<String>,

    /// Version being rolled out, if it differs from the current one
    pub target_version: Option<String>,

    /// Generation of the spec this status was derived from
    pub observed_generation: Option<i64>,

    /// Error message if any
    pub message: Option<String>,
}

/// Phase of the cluster lifecycle
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Members are being created or are not all ready yet
    #[default]
    Creating,
    /// Every member of every configured component is ready
    Running,
    /// The last reconcile pass failed
    Failed,
}

/// The DgraphCluster CRD labelled with its schema revision
pub fn dgraph_cluster_crd() -> CustomResourceDefinition {
    let mut crd = DgraphCluster::crd();
    crd.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(
            CRD_SCHEMA_VERSION_LABEL.to_string(),
            CRD_SCHEMA_VERSION.to_string(),
        );
    crd
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}
