//! Daemon assembly: wires configuration into the running services.

pub mod shutdown;

use crate::agent::build_capability;
use crate::api::{self, AppState};
use crate::backup::BackupStore;
use crate::changelog::ChangeLog;
use crate::config::Config;
use crate::executor::MutationEngine;
use crate::health::HealthProbe;
use crate::policy::{self, SafeDirectoryPolicy};
use crate::status::StatusReporter;
use crate::supervisor::Supervisor;
use crate::utils::Result;
use shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Daemon {
    config: Config,
    health: Arc<HealthProbe>,
    supervisor: Arc<Supervisor>,
    reporter: Arc<StatusReporter>,
}

impl Daemon {
    /// Open the stores, load the policy and register every configured agent.
    /// Nothing is started yet.
    pub fn build(config: Config) -> Result<Self> {
        // Opening the stores creates the data directory the policy protects
        let backups = Arc::new(BackupStore::open(&config.daemon.backups_dir())?);
        let changelog = Arc::new(ChangeLog::open(
            &config.daemon.changelog_path(),
            config.changelog.sync_every_append,
        )?);

        let policy = Arc::new(SafeDirectoryPolicy::from_config(
            &config.policy,
            &config.daemon.data_dir,
        )?);
        if policy.allowed_roots().is_empty() {
            warn!("No safe directories configured, every mutation will be rejected");
        }
        let health = Arc::new(HealthProbe::from_config(&config.health)?);

        let engine = Arc::new(MutationEngine::new(
            Arc::clone(&policy),
            Arc::clone(&backups),
            Arc::clone(&changelog),
            config.changelog.record_proposals,
        ));
        let supervisor = Arc::new(Supervisor::new(
            engine,
            health.subscribe(),
            config.restart.clone(),
            config.daemon.stop_timeout(),
        ));

        for agent in &config.agents {
            let inside = policy::resolve(&agent.root)
                .map(|root| policy.allowed_roots().iter().any(|safe| root.starts_with(safe)))
                .unwrap_or(false);
            if !inside {
                warn!(
                    agent_id = %agent.id,
                    root = %agent.root.display(),
                    "Agent root is not inside a safe directory, its mutations will be rejected"
                );
            }
            supervisor.register(agent.clone(), build_capability(agent)?)?;
        }

        let reporter = Arc::new(StatusReporter::new(
            Arc::clone(&supervisor),
            backups,
            changelog,
            Arc::clone(&health),
        ));

        Ok(Self {
            config,
            health,
            supervisor,
            reporter,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    /// Serve until SIGINT/SIGTERM, then shut down gracefully
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let coordinator = ShutdownCoordinator::new();

        let probe_task = Arc::clone(&self.health).start(coordinator.token());
        let status_task = Arc::clone(&self.reporter).start(
            self.config.daemon.status_path(),
            Duration::from_secs(self.config.daemon.status_interval_secs.max(1)),
            coordinator.token(),
        );

        let started = self.supervisor.start_autostart();
        info!(agents = started.len(), "Autostart agents launched");

        let app = api::create_router(AppState {
            supervisor: Arc::clone(&self.supervisor),
            reporter: Arc::clone(&self.reporter),
        });
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);
        info!("Status endpoint: http://{}/status", addr);

        let server_stop = CancellationToken::new();
        let server = axum::serve(listener, app).with_graceful_shutdown({
            let stop = server_stop.clone();
            async move { stop.cancelled().await }
        });
        let server_handle = tokio::spawn(async move { server.await });

        coordinator.wait_for_signal().await;
        coordinator
            .shutdown(&self.supervisor, vec![probe_task, status_task])
            .await;

        server_stop.cancel();
        match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
            Ok(Ok(Ok(()))) => info!("Server shutdown complete"),
            Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server shutdown timeout, forcing exit"),
        }

        Ok(())
    }
}
