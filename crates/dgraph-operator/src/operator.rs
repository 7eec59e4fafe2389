//! Operator runtime: startup sequence and shutdown

use crate::config::OperatorConfig;
use crate::controller::run_controller;
use crate::crd::dgraph_cluster_crd;
use crate::crd_gate::{CrdGate, KubeCrdApi};
use crate::error::Result;
use crate::leader::{default_identity, KubeLeaseLock, LeaderElector};
use crate::supervisor::ControllerSupervisor;
use crate::version::supports_crd_v1;
use futures::FutureExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the operator until `cancel` fires.
///
/// Startup order: API server version, CRD gate, then the controller, either
/// directly or behind leader election.
pub async fn run(client: Client, config: OperatorConfig, cancel: CancellationToken) -> Result<()> {
    let server = client.apiserver_version().await?;
    info!(
        major = %server.major,
        minor = %server.minor,
        git_version = %server.git_version,
        "Connected to Kubernetes API server"
    );

    let mut create_crd = !config.crd.skip_creation;
    if create_crd && !supports_crd_v1(&server) {
        warn!("API server does not serve apiextensions.k8s.io/v1, skipping CRD creation");
        create_crd = false;
    }

    CrdGate::new(Box::new(KubeCrdApi::new(client.clone())))
        .with_timing(config.crd_poll_interval(), config.crd_poll_timeout())
        .ensure(&dgraph_cluster_crd(), create_crd, &cancel)
        .await?;
    if cancel.is_cancelled() {
        return Ok(());
    }

    let settings = config.controller_settings();

    if !config.leader_election.enabled {
        info!("Leader election disabled");
        return run_controller(client, settings, cancel).await;
    }

    let identity = default_identity();
    let lease_namespace = config.lease_namespace();
    let election = config.election_config(identity);
    election.validate()?;

    let lock = KubeLeaseLock::new(
        client.clone(),
        &lease_namespace,
        &config.leader_election.lease_name,
    );
    let elector = LeaderElector::new(Box::new(lock), election);

    let supervisor = ControllerSupervisor::new(Box::new(move |token| {
        let client = client.clone();
        let settings = settings.clone();
        async move { run_controller(client, settings, token).await }.boxed()
    }));

    let result = elector.run(&cancel, &supervisor).await;
    info!(state = ?elector.state(), "Leader election stopped");
    result
}

/// Cancel `cancel` on SIGINT or SIGTERM
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
