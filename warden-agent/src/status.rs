//! Read-only aggregate of supervisor, backup, health and change log state.

use crate::backup::{BackupStats, BackupStore};
use crate::changelog::{ChangeLog, ChangeLogStats};
use crate::fs::write_atomic;
use crate::health::{HealthProbe, HealthStatus};
use crate::supervisor::{AgentState, AgentStatus, Supervisor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub host: String,
    pub version: String,
    pub agents: Vec<AgentStatus>,
    pub health: HealthStatus,
    pub health_endpoint: Option<String>,
    pub backups: BackupStats,
    pub changelog: ChangeLogStats,
    pub safe_directories: Vec<PathBuf>,
}

impl StatusSnapshot {
    /// Multi-line text for terminals and monitor scripts
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "warden {} on {} at {}",
            self.version,
            self.host,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let backend = match (&self.health_endpoint, self.health.backend_reachable) {
            (None, _) => "not configured".to_string(),
            (Some(endpoint), true) => format!(
                "reachable ({endpoint}, {}ms)",
                self.health.latency_ms.unwrap_or_default()
            ),
            (Some(endpoint), false) => format!(
                "UNREACHABLE ({endpoint}: {})",
                self.health.last_error.as_deref().unwrap_or("no check yet")
            ),
        };
        let _ = writeln!(out, "backend:   {backend}");
        let _ = writeln!(
            out,
            "backups:   {} snapshots, {} objects, {} bytes",
            self.backups.snapshots, self.backups.objects, self.backups.stored_bytes
        );
        let _ = writeln!(
            out,
            "changelog: {} entries (last seq {})",
            self.changelog.entries, self.changelog.last_seq
        );
        for dir in &self.safe_directories {
            let _ = writeln!(out, "safe:      {}", dir.display());
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<20} {:<17} {:>8} {:>8} {:>8}  {}",
            "AGENT", "STATE", "CYCLES", "APPLIED", "RESTARTS", "LAST HEARTBEAT"
        );
        for agent in &self.agents {
            let heartbeat = agent
                .last_heartbeat
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<20} {:<17} {:>8} {:>8} {:>8}  {}",
                agent.id, agent.state, agent.cycles, agent.applied, agent.restart_count, heartbeat
            );
            if agent.state == AgentState::StoppedByError || agent.state == AgentState::Failing {
                let _ = writeln!(
                    out,
                    "  ! {}/{} failures: {}",
                    agent.consecutive_failures,
                    agent.retry_budget,
                    agent.last_error.as_deref().unwrap_or("unknown")
                );
            }
            if agent.needs_intervention {
                let _ = writeln!(out, "  ! manual intervention required");
            }
        }
        if self.agents.is_empty() {
            let _ = writeln!(out, "(no agents configured)");
        }
        out
    }
}

pub struct StatusReporter {
    supervisor: Arc<Supervisor>,
    backups: Arc<BackupStore>,
    changelog: Arc<ChangeLog>,
    health: Arc<HealthProbe>,
    host: String,
}

impl StatusReporter {
    pub fn new(
        supervisor: Arc<Supervisor>,
        backups: Arc<BackupStore>,
        changelog: Arc<ChangeLog>,
        health: Arc<HealthProbe>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            supervisor,
            backups,
            changelog,
            health,
            host,
        }
    }

    /// Assemble a snapshot. Scans the backup directory, so call it off the
    /// async executor.
    pub fn snapshot(&self) -> StatusSnapshot {
        let backups = self.backups.stats().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read backup stats");
            BackupStats::default()
        });

        StatusSnapshot {
            generated_at: Utc::now(),
            host: self.host.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            agents: self.supervisor.list(),
            health: self.health.current(),
            health_endpoint: self.health.endpoint(),
            backups,
            changelog: self.changelog.stats(),
            safe_directories: self.supervisor.engine().policy().allowed_roots().to_vec(),
        }
    }

    pub async fn snapshot_async(self: &Arc<Self>) -> StatusSnapshot {
        let reporter = Arc::clone(self);
        match tokio::task::spawn_blocking(move || reporter.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Status snapshot task failed, building inline");
                self.snapshot()
            }
        }
    }

    pub fn write_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        write_atomic(path, &json)
    }

    /// Rewrite `path` every `interval` until cancelled, plus once on the way out
    pub fn start(
        self: Arc<Self>,
        path: PathBuf,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.write_in_background(&path).await,
                }
            }
            self.write_in_background(&path).await;
            info!(path = %path.display(), "Status writer stopped");
        })
    }

    async fn write_in_background(self: &Arc<Self>, path: &Path) {
        let reporter = Arc::clone(self);
        let target = path.to_path_buf();
        match tokio::task::spawn_blocking(move || reporter.write_file(&target)).await {
            Ok(Ok(())) => debug!(path = %path.display(), "Status file written"),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to write status file"),
            Err(e) => warn!(error = %e, "Status writer task failed"),
        }
    }
}
