//! Dgraph alpha manifests

use super::{
    build_container, container_port, headless_name, service_port, Component, ResourceBuilder,
};
use crate::defaults::{
    ALPHA_GRPC_PORT, ALPHA_GRPC_PORT_NAME, ALPHA_HTTP_PORT, ALPHA_HTTP_PORT_NAME,
    ALPHA_INTERNAL_PORT, ALPHA_INTERNAL_PORT_NAME, ALPHA_VOLUME_MOUNT_PATH, ZERO_GRPC_PORT,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ContainerPort, Service, ServicePort};

impl ResourceBuilder<'_> {
    /// Build the addressable alpha service
    pub fn build_alpha_service(&self) -> Service {
        let resolved = self.cluster.spec.alpha_component();
        self.build_service(Component::Alpha, &resolved, alpha_service_ports())
    }

    /// Build the headless alpha service
    pub fn build_alpha_headless_service(&self) -> Service {
        self.build_headless_service(Component::Alpha, alpha_service_ports())
    }

    /// Build the alpha StatefulSet.
    ///
    /// Alpha finds the cluster through the first zero's headless DNS name,
    /// so the zero objects must exist before this workload starts.
    pub fn build_alpha_statefulset(&self) -> StatefulSet {
        let spec = &self.cluster.spec;
        let resolved = spec.alpha_component();
        let name = self.member_name(Component::Alpha);
        let zero = self.member_name(Component::Zero);
        let command = vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            alpha_run_command(&zero, spec.alpha.lru_mb(), spec.alpha.jaeger_collector()),
        ];
        let container = build_container(name, &resolved, command, alpha_container_ports());

        self.build_statefulset(
            Component::Alpha,
            spec.alpha.replicas,
            &resolved,
            container,
            spec.alpha.persistent_storage.as_ref(),
            ALPHA_VOLUME_MOUNT_PATH,
        )
    }
}

fn alpha_service_ports() -> Vec<ServicePort> {
    vec![
        service_port(ALPHA_GRPC_PORT_NAME, ALPHA_GRPC_PORT),
        service_port(ALPHA_HTTP_PORT_NAME, ALPHA_HTTP_PORT),
    ]
}

fn alpha_container_ports() -> Vec<ContainerPort> {
    vec![
        container_port(ALPHA_INTERNAL_PORT_NAME, ALPHA_INTERNAL_PORT),
        container_port(ALPHA_HTTP_PORT_NAME, ALPHA_HTTP_PORT),
        container_port(ALPHA_GRPC_PORT_NAME, ALPHA_GRPC_PORT),
    ]
}

pub(crate) fn alpha_run_command(zero_member: &str, lru_mb: i32, jaeger: Option<&str>) -> String {
    let jaeger = jaeger
        .map(|url| format!(" --jaeger.collector {}", url))
        .unwrap_or_default();

    format!(
        "set -ex\nexec dgraph alpha --my=$(hostname -f):{internal} --lru_mb {lru_mb} \
         --zero {zero}-0.{headless}.${{POD_NAMESPACE}}.svc.cluster.local:{zero_port}{jaeger}\n",
        internal = ALPHA_INTERNAL_PORT,
        lru_mb = lru_mb,
        zero = zero_member,
        headless = headless_name(zero_member),
        zero_port = ZERO_GRPC_PORT,
        jaeger = jaeger,
    )
}
