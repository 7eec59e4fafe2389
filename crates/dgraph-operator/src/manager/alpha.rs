use super::{members, sync_stateful, ComponentSyncer, ResourceClients};
use crate::crd::{DgraphCluster, DgraphClusterStatus};
use crate::error::Result;
use crate::resources::{Component, ResourceBuilder};
use async_trait::async_trait;

/// Alpha services and StatefulSet, run after zero
pub struct AlphaSyncer {
    clients: ResourceClients,
}

impl AlphaSyncer {
    pub fn new(clients: ResourceClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ComponentSyncer for AlphaSyncer {
    fn component(&self) -> Component {
        Component::Alpha
    }

    async fn sync(&self, cluster: &DgraphCluster, status: &mut DgraphClusterStatus) -> Result<()> {
        let builder = ResourceBuilder::new(cluster)?;
        let namespace = builder.namespace();

        sync_stateful(
            &self.clients,
            namespace,
            &builder.build_alpha_service(),
            &builder.build_alpha_headless_service(),
            &builder.build_alpha_statefulset(),
        )
        .await?;

        status.alpha = members(
            self.clients.pods.as_ref(),
            namespace,
            &builder.labels(Component::Alpha),
        );
        Ok(())
    }
}
