use super::{members, sync_stateful, ComponentSyncer, ResourceClients};
use crate::crd::{DgraphCluster, DgraphClusterStatus};
use crate::error::Result;
use crate::resources::{Component, ResourceBuilder};
use async_trait::async_trait;

/// Zero services and StatefulSet
pub struct ZeroSyncer {
    clients: ResourceClients,
}

impl ZeroSyncer {
    pub fn new(clients: ResourceClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ComponentSyncer for ZeroSyncer {
    fn component(&self) -> Component {
        Component::Zero
    }

    async fn sync(&self, cluster: &DgraphCluster, status: &mut DgraphClusterStatus) -> Result<()> {
        let builder = ResourceBuilder::new(cluster)?;
        let namespace = builder.namespace();

        sync_stateful(
            &self.clients,
            namespace,
            &builder.build_zero_service(),
            &builder.build_zero_headless_service(),
            &builder.build_zero_statefulset(),
        )
        .await?;

        status.zero = members(
            self.clients.pods.as_ref(),
            namespace,
            &builder.labels(Component::Zero),
        );
        Ok(())
    }
}
