//! Dgraph ratel (UI) manifests

use super::{build_container, container_port, non_empty_map, service_port, Component, ResourceBuilder};
use crate::crd::RatelSpec;
use crate::defaults::{RATEL_PORT, RATEL_PORT_NAME};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

impl ResourceBuilder<'_> {
    /// Build the ratel service
    pub fn build_ratel_service(&self, ratel: &RatelSpec) -> Service {
        let resolved = ratel.common.resolve(&self.cluster.spec);
        self.build_service(
            Component::Ratel,
            &resolved,
            vec![service_port(RATEL_PORT_NAME, RATEL_PORT)],
        )
    }

    /// Build the stateless ratel Deployment
    pub fn build_ratel_deployment(&self, ratel: &RatelSpec) -> Deployment {
        let resolved = ratel.common.resolve(&self.cluster.spec);
        let name = self.member_name(Component::Ratel);
        let labels = self.labels(Component::Ratel);
        let container = build_container(
            name.clone(),
            &resolved,
            vec!["dgraph-ratel".to_string()],
            vec![container_port(RATEL_PORT_NAME, RATEL_PORT)],
        );

        Deployment {
            metadata: self.object_meta(name, Component::Ratel),
            spec: Some(DeploymentSpec {
                replicas: Some(ratel.replicas),
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
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Always".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
