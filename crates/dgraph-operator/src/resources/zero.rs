//! Dgraph zero manifests

use super::{
    build_container, container_port, headless_name, service_port, Component, ResourceBuilder,
};
use crate::defaults::{
    ZERO_GRPC_PORT, ZERO_GRPC_PORT_NAME, ZERO_HTTP_PORT, ZERO_HTTP_PORT_NAME,
    ZERO_VOLUME_MOUNT_PATH,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ContainerPort, Service, ServicePort};

impl ResourceBuilder<'_> {
    /// Build the addressable zero service
    pub fn build_zero_service(&self) -> Service {
        let resolved = self.cluster.spec.zero_component();
        self.build_service(Component::Zero, &resolved, zero_service_ports())
    }

    /// Build the headless zero service, which gives every zero a stable DNS name
    pub fn build_zero_headless_service(&self) -> Service {
        self.build_headless_service(Component::Zero, zero_service_ports())
    }

    /// Build the zero StatefulSet
    pub fn build_zero_statefulset(&self) -> StatefulSet {
        let spec = &self.cluster.spec;
        let resolved = spec.zero_component();
        let name = self.member_name(Component::Zero);
        let command = vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            zero_run_command(
                &name,
                spec.zero.shard_replica_count(),
                spec.zero.jaeger_collector(),
            ),
        ];
        let container = build_container(name, &resolved, command, zero_container_ports());

        self.build_statefulset(
            Component::Zero,
            spec.zero.replicas,
            &resolved,
            container,
            spec.zero.persistent_storage.as_ref(),
            ZERO_VOLUME_MOUNT_PATH,
        )
    }
}

fn zero_service_ports() -> Vec<ServicePort> {
    vec![
        service_port(ZERO_GRPC_PORT_NAME, ZERO_GRPC_PORT),
        service_port(ZERO_HTTP_PORT_NAME, ZERO_HTTP_PORT),
    ]
}

fn zero_container_ports() -> Vec<ContainerPort> {
    vec![
        container_port(ZERO_GRPC_PORT_NAME, ZERO_GRPC_PORT),
        container_port(ZERO_HTTP_PORT_NAME, ZERO_HTTP_PORT),
    ]
}

/// Startup script for zero.
///
/// The pod ordinal becomes the raft index (`ordinal + 1`); every zero except
/// the first one joins through the first zero's headless DNS name.
pub(crate) fn zero_run_command(
    member: &str,
    shard_replicas: i32,
    jaeger_collector: Option<&str>,
) -> String {
    let headless = headless_name(member);
    let jaeger = jaeger_collector
        .map(|url| format!(" --jaeger.collector {}", url))
        .unwrap_or_default();

    format!(
        r#"set -ex
[[ $(hostname) =~ -([0-9]+)$ ]] || exit 1
ordinal=${{BASH_REMATCH[1]}}
idx=$(($ordinal + 1))
if [[ $ordinal -eq 0 ]]; then
    exec dgraph zero --my=$(hostname -f):{port} --idx $idx --replicas {replicas}{jaeger}
else
    exec dgraph zero --my=$(hostname -f):{port} --peer {member}-0.{headless}.${{POD_NAMESPACE}}.svc.cluster.local:{port} \
        --idx $idx --replicas {replicas}{jaeger}
fi"#,
        port = ZERO_GRPC_PORT,
        replicas = shard_replicas,
        member = member,
        headless = headless,
        jaeger = jaeger,
    )
}
