//! Dgraph Kubernetes Operator
//!
//! This operator manages `DgraphCluster` custom resources, deploying and
//! keeping in shape Dgraph clusters made of zero, alpha and an optional
//! ratel UI.
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: dgraph.io/v1alpha1
//! kind: DgraphCluster
//! metadata:
//!   name: prod
//! spec:
//!   clusterID: c1
//!   version: v20.03.0
//!   zero:
//!     replicas: 3
//!     persistentStorage:
//!       requests:
//!         storage: 5Gi
//!   alpha:
//!     replicas: 3
//!     serviceType: LoadBalancer
//!     config:
//!       lruMB: 4096
//!   ratel:
//!     replicas: 1
//! ```
//!
//! Every child object is named `<clusterID>-<name>-<component>` and owned
//! by the cluster, so deleting the cluster garbage collects its children.
//!
//! ## Reconciliation
//!
//! - Watch events are collapsed into one reconcile request per cluster by the
//!   kube-runtime controller; a cluster is never reconciled twice at once
//! - Components converge in order: zero, alpha, ratel
//! - Objects are only written when the desired manifest is not already
//!   reflected in the live object, and updates keep fields the platform
//!   filled in
//! - Status is written through the status sub-resource, and only on change
//!
//! ## High Availability
//!
//! Replicas compete for a Lease; only the holder runs the controller.
//!
//! ## Metrics
//!
//! - `dgraph_operator_reconciliations_total` - Total reconciliation attempts
//! - `dgraph_operator_reconciliation_errors_total` - Reconciliation errors
//! - `dgraph_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `dgraph_operator_status_updates_total` - Status writes
//! - `dgraph_operator_component_sync_errors_total` - Failed component syncs
//! - `dgraph_operator_leader` - 1 while this replica leads

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod crd_gate;
pub mod defaults;
pub mod diff;
pub mod error;
pub mod leader;
pub mod manager;
pub mod operator;
pub mod resources;
pub mod server;
pub mod status;
pub mod supervisor;
pub mod sync;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::client::{ClusterClient, ObjectKey, ResourceClient};
    pub use crate::config::{ConfigOverrides, OperatorConfig};
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, ControllerSettings,
    };
    pub use crate::crd::{
        dgraph_cluster_crd, AlphaClusterSpec, AlphaConfig, ClusterPhase, ComponentSpec,
        DgraphCluster, DgraphClusterSpec, DgraphClusterStatus, MembersStatus,
        PersistentStorageSpec, RatelSpec, ZeroClusterSpec, ZeroConfig,
    };
    pub use crate::crd_gate::CrdGate;
    pub use crate::error::{OperatorError, Result};
    pub use crate::leader::{LeaderElectionConfig, LeaderElector, LeaderState};
    pub use crate::manager::{ComponentSyncer, ManagerChain};
    pub use crate::resources::{Component, ResourceBuilder};
}
