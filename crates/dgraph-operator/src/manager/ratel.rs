use super::{members, ComponentSyncer, ResourceClients};
use crate::crd::{DgraphCluster, DgraphClusterStatus, MembersStatus};
use crate::error::Result;
use crate::resources::{Component, ResourceBuilder};
use crate::sync::sync_resource;
use async_trait::async_trait;
use tracing::debug;

/// Optional ratel service and Deployment
pub struct RatelSyncer {
    clients: ResourceClients,
}

impl RatelSyncer {
    pub fn new(clients: ResourceClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ComponentSyncer for RatelSyncer {
    fn component(&self) -> Component {
        Component::Ratel
    }

    async fn sync(&self, cluster: &DgraphCluster, status: &mut DgraphClusterStatus) -> Result<()> {
        let Some(ratel) = cluster.spec.ratel.as_ref() else {
            debug!("Ratel not configured");
            status.ratel = MembersStatus::default();
            return Ok(());
        };

        let builder = ResourceBuilder::new(cluster)?;
        let namespace = builder.namespace();

        sync_resource(
            self.clients.services.as_ref(),
            namespace,
            &builder.build_ratel_service(ratel),
        )
        .await?;
        sync_resource(
            self.clients.deployments.as_ref(),
            namespace,
            &builder.build_ratel_deployment(ratel),
        )
        .await?;

        status.ratel = members(
            self.clients.pods.as_ref(),
            namespace,
            &builder.labels(Component::Ratel),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::{test_cluster, test_cluster_with_ratel};
    use crate::testing::{FakeClients, Write};

    #[tokio::test]
    async fn test_ratel_skipped_when_not_configured() {
        let fakes = FakeClients::new();
        let syncer = RatelSyncer::new(fakes.clients());
        let mut status = DgraphClusterStatus::default();
        status.ratel.ready.push("stale".to_string());

        syncer.sync(&test_cluster(), &mut status).await.unwrap();

        assert_eq!(fakes.total_writes(), 0);
        assert_eq!(status.ratel, MembersStatus::default());
    }

    #[tokio::test]
    async fn test_ratel_creates_service_and_deployment() {
        let fakes = FakeClients::new();
        let syncer = RatelSyncer::new(fakes.clients());
        let mut status = DgraphClusterStatus::default();

        syncer
            .sync(&test_cluster_with_ratel(), &mut status)
            .await
            .unwrap();

        assert_eq!(
            fakes.services.writes(),
            vec![Write::Create("c1-test-cluster-ratel".to_string())]
        );
        assert_eq!(
            fakes.deployments.writes(),
            vec![Write::Create("c1-test-cluster-ratel".to_string())]
        );
    }
}
