//! Starts and stops the controller on leadership changes

use crate::error::Result;
use crate::leader::LeadershipCallbacks;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Builds the controller future for one leadership term
pub type ControllerFactory = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Owns at most one running controller
pub struct ControllerSupervisor {
    factory: ControllerFactory,
    running: Mutex<Option<Running>>,
}

impl ControllerSupervisor {
    pub fn new(factory: ControllerFactory) -> Self {
        Self {
            factory,
            running: Mutex::new(None),
        }
    }

    /// Start the controller unless it is already running
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        info!("Starting controller");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn((self.factory)(cancel.clone()));
        *running = Some(Running { cancel, handle });
    }

    /// Stop the controller and wait for it to exit; no-op when stopped
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        info!("Stopping controller");
        running.cancel.cancel();
        match running.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Controller exited with error"),
            Err(e) => error!(error = %e, "Controller task failed"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

#[async_trait]
impl LeadershipCallbacks for ControllerSupervisor {
    async fn on_started_leading(&self) {
        self.start();
    }

    async fn on_stopped_leading(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_supervisor(starts: &Arc<AtomicUsize>, stops: &Arc<AtomicUsize>) -> ControllerSupervisor {
        let starts = starts.clone();
        let stops = stops.clone();
        ControllerSupervisor::new(Box::new(move |cancel: CancellationToken| {
            starts.fetch_add(1, Ordering::SeqCst);
            let stops = stops.clone();
            async move {
                cancel.cancelled().await;
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }))
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let supervisor = counting_supervisor(&starts, &stops);

        supervisor.start();
        supervisor.start();
        assert!(supervisor.is_running());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        supervisor.start();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_callbacks_drive_supervisor() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let supervisor = counting_supervisor(&starts, &stops);

        supervisor.on_started_leading().await;
        assert!(supervisor.is_running());
        supervisor.on_stopped_leading().await;
        assert!(!supervisor.is_running());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
