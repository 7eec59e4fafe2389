//! Cluster status derivation

use crate::crd::{ClusterPhase, DgraphCluster, DgraphClusterStatus};
use crate::error::Result;

/// Derive the status to persist after a reconcile pass.
///
/// `working` is the previously persisted status with the member lists
/// refreshed by the syncers that ran. The phase is `Failed` when the chain
/// failed, `Running` once every configured component has at least
/// `replicas` ready members and `Creating` otherwise.
pub fn derive_status(
    cluster: &DgraphCluster,
    mut working: DgraphClusterStatus,
    result: &Result<()>,
) -> DgraphClusterStatus {
    let spec = &cluster.spec;
    working.cluster_id = Some(spec.cluster_id.clone());
    working.observed_generation = cluster.metadata.generation;

    match result {
        Err(e) => {
            working.phase = ClusterPhase::Failed;
            working.message = Some(e.to_string());
        }
        Ok(()) if all_members_ready(cluster, &working) => {
            working.phase = ClusterPhase::Running;
            working.current_version = Some(spec.version.clone());
            working.message = None;
        }
        Ok(()) => {
            working.phase = ClusterPhase::Creating;
            working.message = None;
        }
    }

    working.target_version = if working.current_version.as_deref() == Some(spec.version.as_str()) {
        None
    } else {
        Some(spec.version.clone())
    };

    working
}

fn all_members_ready(cluster: &DgraphCluster, status: &DgraphClusterStatus) -> bool {
    let spec = &cluster.spec;
    let ratel_ready = spec
        .ratel
        .as_ref()
        .map_or(true, |ratel| status.ratel.ready_count() >= ratel.replicas);

    status.zero.ready_count() >= spec.zero.replicas
        && status.alpha.ready_count() >= spec.alpha.replicas
        && ratel_ready
}
