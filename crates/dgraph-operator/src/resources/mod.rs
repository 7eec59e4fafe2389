//! Kubernetes Resource Builders
//!
//! This module generates Kubernetes manifests (StatefulSet, Service,
//! Deployment) from DgraphCluster specifications. Every builder is a pure
//! function of the cluster object: child names are derived from
//! `<clusterID>-<clusterName>-<component>` so that the controller can locate
//! "the" resource of a component without any extra index.

mod alpha;
mod ratel;
mod zero;

use crate::crd::{DgraphCluster, PersistentStorageSpec, ResolvedComponent};
use crate::defaults::{
    ALPHA_MEMBER_NAME, HEADLESS_SERVICE_SUFFIX, K8S_DELIMITER, OPERATOR_NAME,
    POD_ANTI_AFFINITY_TOPOLOGY_KEY, POD_ANTI_AFFINITY_WEIGHT, RATEL_MEMBER_NAME, ZERO_MEMBER_NAME,
};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;
use std::fmt;

pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// A managed Dgraph component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Zero,
    Alpha,
    Ratel,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Zero => ZERO_MEMBER_NAME,
            Component::Alpha => ALPHA_MEMBER_NAME,
            Component::Ratel => RATEL_MEMBER_NAME,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<clusterID>-<clusterName>-<suffix>`
pub fn member_name(cluster_id: &str, cluster_name: &str, suffix: &str) -> String {
    [cluster_id, cluster_name, suffix].join(K8S_DELIMITER)
}

/// Name of the headless service fronting a member
pub fn headless_name(member: &str) -> String {
    format!("{}{}{}", member, K8S_DELIMITER, HEADLESS_SERVICE_SUFFIX)
}

/// Builder for generating Kubernetes resources from a DgraphCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a DgraphCluster,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a DgraphCluster) -> Result<Self> {
        let name =
            cluster.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("cluster name is required".to_string())
            })?;

        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            cluster,
            name,
            namespace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Deterministic name of a component's workload and addressable service
    pub fn member_name(&self, component: Component) -> String {
        member_name(&self.cluster.spec.cluster_id, &self.name, component.as_str())
    }

    pub fn headless_service_name(&self, component: Component) -> String {
        headless_name(&self.member_name(component))
    }

    /// Labels shared by every object of a component, also used as selector
    pub fn labels(&self, component: Component) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_INSTANCE.to_string(), self.member_name(component)),
            (LABEL_COMPONENT.to_string(), component.as_str().to_string()),
            (LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
        ])
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: DgraphCluster::api_version(&()).to_string(),
            kind: DgraphCluster::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn object_meta(&self, name: String, component: Component) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(component)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the addressable service of a component
    fn build_service(
        &self,
        component: Component,
        resolved: &ResolvedComponent,
        ports: Vec<ServicePort>,
    ) -> Service {
        Service {
            metadata: self.object_meta(self.member_name(component), component),
            spec: Some(ServiceSpec {
                type_: Some(resolved.service_type.clone()),
                ports: Some(ports),
                selector: Some(self.labels(component)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the headless service used for stable per-pod DNS
    fn build_headless_service(&self, component: Component, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: self.object_meta(self.headless_service_name(component), component),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ports: Some(ports),
                selector: Some(self.labels(component)),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build a stateful workload with ordered startup and stable identity
    fn build_statefulset(
        &self,
        component: Component,
        replicas: i32,
        resolved: &ResolvedComponent,
        mut container: Container,
        storage: Option<&PersistentStorageSpec>,
        mount_path: &str,
    ) -> StatefulSet {
        let name = self.member_name(component);
        let labels = self.labels(component);

        container.volume_mounts = Some(vec![VolumeMount {
            name: name.clone(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        }]);

        // Without persistent storage the data lives in an emptyDir
        let (volumes, volume_claim_templates) = match storage {
            Some(storage) => (None, Some(vec![self.build_pvc_template(&name, storage)])),
            None => (
                Some(vec![Volume {
                    name: name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                None,
            ),
        };

        let pod_spec = PodSpec {
            affinity: Some(pod_anti_affinity(component)),
            containers: vec![container],
            volumes,
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        };

        StatefulSet {
            metadata: self.object_meta(name.clone(), component),
            spec: Some(StatefulSetSpec {
                service_name: self.headless_service_name(component),
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: non_empty_map(&resolved.annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates,
                pod_management_policy: Some("OrderedReady".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        partition: Some(0),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_pvc_template(&self, name: &str, storage: &PersistentStorageSpec) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage
                    .storage_class_name
                    .clone()
                    .filter(|class| !class.is_empty()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(storage.requests.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Build the main container of a component pod
fn build_container(
    name: String,
    resolved: &ResolvedComponent,
    command: Vec<String>,
    ports: Vec<ContainerPort>,
) -> Container {
    Container {
        name,
        image: Some(resolved.image()),
        image_pull_policy: resolved.image_pull_policy.clone(),
        command: Some(command),
        ports: Some(ports),
        env: Some(vec![pod_namespace_env()]),
        resources: resolved.resources.clone(),
        ..Default::default()
    }
}

/// Exposes the pod namespace to the startup scripts
fn pod_namespace_env() -> EnvVar {
    EnvVar {
        name: "POD_NAMESPACE".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.namespace".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Spread the members of a component across nodes when possible
fn pod_anti_affinity(component: Component) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: POD_ANTI_AFFINITY_WEIGHT,
                    pod_affinity_term: PodAffinityTerm {
                        topology_key: POD_ANTI_AFFINITY_TOPOLOGY_KEY.to_string(),
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                LABEL_COMPONENT.to_string(),
                                component.as_str().to_string(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}
