//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Ensures that:
//! - Agents finish their in-flight mutation before stopping
//! - The final status file reflects stopped agents
//! - Background tasks are joined before the process exits

use crate::supervisor::Supervisor;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token for background tasks; cancelled once agents are stopped
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {}
        }
    }

    /// Stop every agent, then cancel and join the background tasks
    pub async fn shutdown(&self, supervisor: &Supervisor, tasks: Vec<JoinHandle<()>>) {
        info!("Graceful shutdown initiated");

        match supervisor.stop(None).await {
            Ok(results) => {
                let stopped = results.iter().filter(|r| r.changed).count();
                info!(stopped, "Agents stopped");
            }
            Err(e) => error!(error = %e, "Failed to stop agents"),
        }

        self.token.cancel();
        for task in tasks {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupStore;
    use crate::changelog::ChangeLog;
    use crate::config::RestartConfig;
    use crate::executor::MutationEngine;
    use crate::health::HealthStatus;
    use crate::policy::SafeDirectoryPolicy;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_shutdown_cancels_background_tasks() {
        let dir = TempDir::new().unwrap();
        let safe = dir.path().join("safe");
        std::fs::create_dir_all(&safe).unwrap();
        let engine = Arc::new(MutationEngine::new(
            Arc::new(SafeDirectoryPolicy::load(&[safe], &[]).unwrap()),
            Arc::new(BackupStore::open(&dir.path().join("backups")).unwrap()),
            Arc::new(ChangeLog::open(&dir.path().join("changes.log"), false).unwrap()),
            false,
        ));
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let supervisor = Supervisor::new(engine, rx, RestartConfig::default(), Duration::from_secs(1));

        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        let task = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.shutdown(&supervisor, vec![task]).await;

        assert!(coordinator.is_shutting_down());
        // Already cancelled: returns immediately
        coordinator.wait_for_signal().await;
    }
}
