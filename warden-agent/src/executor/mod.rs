//! Agent executor - the cooperative per-agent work loop.
//!
//! One cycle: heartbeat, check backend health, ask the capability for
//! proposals, push each through the [`MutationEngine`], sleep. Cancellation
//! is observed only at safe points: while waiting on a proposal, between
//! requests, and during the sleep. A request that has started always runs
//! to its change log entry.

pub mod pipeline;

pub use pipeline::{Applied, MutationEngine};

use crate::agent::{walk_options, Capability, WorkspaceView};
use crate::config::AgentConfig;
use crate::health::HealthStatus;
use crate::utils::MutationError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a running agent needs; cheap to clone
#[derive(Clone)]
pub struct AgentContext {
    pub config: AgentConfig,
    pub capability: Arc<dyn Capability>,
    pub engine: Arc<MutationEngine>,
    pub health: watch::Receiver<HealthStatus>,
}

impl AgentContext {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Config override first, then the capability's own declaration
    pub fn backend_dependent(&self) -> bool {
        self.config
            .backend_dependent
            .unwrap_or_else(|| self.capability.requires_backend())
    }
}

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub proposed: usize,
    pub applied: usize,
    pub rejected: usize,
    pub rolled_back: usize,
    /// Backend was down, nothing was proposed
    pub skipped: bool,
    pub propose_error: Option<String>,
}

/// Why an attempt of the work loop ended badly
#[derive(Debug)]
pub enum AgentFailure {
    Mutation(MutationError),
    Panicked(String),
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentFailure::Mutation(e) => write!(f, "{e}"),
            AgentFailure::Panicked(msg) => write!(f, "agent task panicked: {msg}"),
        }
    }
}

#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    Failed(AgentFailure),
}

/// Receives liveness signals from the work loop
pub trait LoopObserver: Send + Sync {
    fn heartbeat(&self);
    fn cycle_completed(&self, report: &CycleReport);
}

enum CycleEnd {
    Cancelled,
    Fatal(MutationError),
}

/// Run until cancelled or a fatal error occurs
pub async fn run_agent(
    ctx: &AgentContext,
    observer: &dyn LoopObserver,
    cancel: &CancellationToken,
) -> LoopExit {
    let interval = ctx.config.cycle_interval();
    let mut cycle = 0u64;

    info!(agent_id = %ctx.id(), capability = ctx.capability.name(), "Agent loop started");

    loop {
        if cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }
        observer.heartbeat();
        cycle += 1;

        match run_cycle(ctx, cycle, cancel).await {
            Ok(report) => observer.cycle_completed(&report),
            Err(CycleEnd::Cancelled) => return LoopExit::Cancelled,
            Err(CycleEnd::Fatal(e)) => return LoopExit::Failed(AgentFailure::Mutation(e)),
        }

        tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn run_cycle(
    ctx: &AgentContext,
    cycle: u64,
    cancel: &CancellationToken,
) -> Result<CycleReport, CycleEnd> {
    let mut report = CycleReport {
        cycle,
        ..CycleReport::default()
    };
    let health = ctx.health.borrow().clone();

    if ctx.backend_dependent() && !health.backend_reachable {
        debug!(agent_id = %ctx.id(), cycle, "Backend unreachable, skipping cycle");
        report.skipped = true;
        return Ok(report);
    }

    let view = WorkspaceView {
        agent_id: ctx.id().to_string(),
        root: ctx.config.root.clone(),
        cycle,
        health,
        walk: walk_options(&ctx.config),
    };

    // Nothing has touched the disk yet, so a proposal in flight may be dropped
    let proposals = tokio::select! {
        _ = cancel.cancelled() => return Err(CycleEnd::Cancelled),
        result = ctx.capability.propose(&view) => result,
    };
    let requests = match proposals {
        Ok(requests) => requests,
        Err(e) => {
            warn!(agent_id = %ctx.id(), cycle, error = %e, "Proposal failed");
            report.propose_error = Some(e.to_string());
            return Ok(report);
        }
    };
    report.proposed = requests.len();

    for request in requests {
        if cancel.is_cancelled() {
            return Err(CycleEnd::Cancelled);
        }

        match ctx
            .engine
            .execute(ctx.id(), &ctx.capability, request, &ctx.config.root)
            .await
        {
            Ok(_) => report.applied += 1,
            Err(e) if e.is_fatal() => return Err(CycleEnd::Fatal(e)),
            Err(MutationError::ApplyFailure(_)) => report.rolled_back += 1,
            Err(_) => report.rejected += 1,
        }
    }

    if report.proposed > 0 {
        info!(
            agent_id = %ctx.id(),
            cycle,
            proposed = report.proposed,
            applied = report.applied,
            rejected = report.rejected,
            rolled_back = report.rolled_back,
            "Cycle complete"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MutationRequest, Tidy};
    use crate::backup::BackupStore;
    use crate::changelog::{ChangeAction, ChangeLog};
    use crate::policy::SafeDirectoryPolicy;
    use crate::utils::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        heartbeats: Mutex<u32>,
        reports: Mutex<Vec<CycleReport>>,
    }

    impl LoopObserver for Recorder {
        fn heartbeat(&self) {
            *self.heartbeats.lock() += 1;
        }

        fn cycle_completed(&self, report: &CycleReport) {
            self.reports.lock().push(report.clone());
        }
    }

    /// Proposes a fixed set of writes and needs the backend
    struct NeedsBackend(Vec<MutationRequest>);

    #[async_trait]
    impl Capability for NeedsBackend {
        fn name(&self) -> &str {
            "needs-backend"
        }

        fn requires_backend(&self) -> bool {
            true
        }

        async fn propose(&self, _view: &WorkspaceView) -> Result<Vec<MutationRequest>> {
            Ok(self.0.clone())
        }
    }

    fn engine(data: &Path, safe: &Path) -> Arc<MutationEngine> {
        let backups = BackupStore::open(&data.join("backups")).unwrap();
        let changelog = ChangeLog::open(&data.join("changes.log"), false).unwrap();
        let policy = SafeDirectoryPolicy::load(&[safe.to_path_buf()], &[])
            .unwrap()
            .protect(data)
            .unwrap();
        Arc::new(MutationEngine::new(
            Arc::new(policy),
            Arc::new(backups),
            Arc::new(changelog),
            false,
        ))
    }

    fn agent_config(root: &Path) -> AgentConfig {
        AgentConfig {
            id: "a1".to_string(),
            kind: "tidy".to_string(),
            cycle_interval_ms: 10,
            retry_budget: 3,
            root: root.to_path_buf(),
            extensions: Vec::new(),
            endpoint: None,
            backend_dependent: None,
            autostart: true,
        }
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let safe = dir.path().join("safe");
        fs::create_dir_all(&safe).unwrap();
        let safe = fs::canonicalize(safe).unwrap();
        (dir, safe)
    }

    #[tokio::test]
    async fn test_cycle_applies_proposals() {
        let (dir, safe) = setup();
        fs::write(safe.join("notes.md"), "trailing   \n\n\n").unwrap();
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let ctx = AgentContext {
            config: agent_config(&safe),
            capability: Arc::new(Tidy::new()),
            engine: engine(&dir.path().join("data"), &safe),
            health: rx,
        };

        let report = run_cycle(&ctx, 1, &CancellationToken::new()).await.ok().unwrap();

        assert_eq!(report.proposed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(fs::read_to_string(safe.join("notes.md")).unwrap(), "trailing\n");

        // Second cycle has nothing left to do
        let report = run_cycle(&ctx, 2, &CancellationToken::new()).await.ok().unwrap();
        assert_eq!(report.proposed, 0);
    }

    #[tokio::test]
    async fn test_tidy_over_data_dir_does_not_feed_on_its_own_records() {
        let (_dir, safe) = setup();
        fs::write(safe.join("notes.md"), "trailing   \n").unwrap();
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let engine = engine(&safe.join("data"), &safe);
        let ctx = AgentContext {
            config: agent_config(&safe),
            capability: Arc::new(Tidy::new()),
            engine: Arc::clone(&engine),
            health: rx,
        };

        let first = run_cycle(&ctx, 1, &CancellationToken::new()).await.ok().unwrap();
        assert_eq!(first.applied, 1);

        for cycle in 2..=4 {
            let report = run_cycle(&ctx, cycle, &CancellationToken::new()).await.ok().unwrap();
            assert_eq!(report.applied, 0, "cycle {cycle} rewrote supervisor state");
        }
        assert_eq!(engine.backups().stats().unwrap().snapshots, 1);
        assert_eq!(fs::read_to_string(safe.join("notes.md")).unwrap(), "trailing\n");
    }

    #[tokio::test]
    async fn test_lost_log_entry_ends_the_loop() {
        let (dir, safe) = setup();
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let engine = engine(&dir.path().join("data"), &safe);
        let target = safe.join("x.txt");
        let mut config = agent_config(&safe);
        config.backend_dependent = Some(false);
        let ctx = AgentContext {
            config,
            capability: Arc::new(NeedsBackend(vec![MutationRequest::new(&target, "x")])),
            engine: Arc::clone(&engine),
            health: rx,
        };
        engine.changelog().fail_appends().unwrap();

        let exit = tokio::time::timeout(
            Duration::from_secs(2),
            run_agent(&ctx, &Recorder::default(), &CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(
            exit,
            LoopExit::Failed(AgentFailure::Mutation(MutationError::AuditFailure(_)))
        ));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_unreachable_backend_skips_cycle_without_log_entries() {
        let (dir, safe) = setup();
        let target = safe.join("x.txt");
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let engine = engine(&dir.path().join("data"), &safe);
        let ctx = AgentContext {
            config: agent_config(&safe),
            capability: Arc::new(NeedsBackend(vec![MutationRequest::new(&target, "x")])),
            engine: Arc::clone(&engine),
            health: rx,
        };

        let report = run_cycle(&ctx, 1, &CancellationToken::new()).await.ok().unwrap();

        assert!(report.skipped);
        assert!(!target.exists());
        assert!(engine.changelog().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_override_disables_backend_gate() {
        let (dir, safe) = setup();
        let target = safe.join("x.txt");
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let mut config = agent_config(&safe);
        config.backend_dependent = Some(false);
        let ctx = AgentContext {
            config,
            capability: Arc::new(NeedsBackend(vec![MutationRequest::new(&target, "x")])),
            engine: engine(&dir.path().join("data"), &safe),
            health: rx,
        };

        let report = run_cycle(&ctx, 1, &CancellationToken::new()).await.ok().unwrap();

        assert!(!report.skipped);
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn test_reachable_backend_runs_cycle() {
        let (dir, safe) = setup();
        let target = safe.join("x.txt");
        let (tx, rx) = watch::channel(HealthStatus::default());
        tx.send_modify(|s| s.backend_reachable = true);
        let engine = engine(&dir.path().join("data"), &safe);
        let outside = dir.path().join("outside.txt");
        let ctx = AgentContext {
            config: agent_config(&safe),
            capability: Arc::new(NeedsBackend(vec![
                MutationRequest::new(&target, "x"),
                MutationRequest::new(&outside, "y"),
            ])),
            engine: Arc::clone(&engine),
            health: rx,
        };

        let report = run_cycle(&ctx, 1, &CancellationToken::new()).await.ok().unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected, 1);
        assert!(!outside.exists());
        let actions: Vec<_> = engine
            .changelog()
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![ChangeAction::Applied, ChangeAction::Rejected]);
    }

    #[tokio::test]
    async fn test_loop_heartbeats_and_stops_on_cancel() {
        let (dir, safe) = setup();
        let (_tx, rx) = watch::channel(HealthStatus::default());
        let ctx = AgentContext {
            config: agent_config(&safe),
            capability: Arc::new(Tidy::new()),
            engine: engine(&dir.path().join("data"), &safe),
            health: rx,
        };
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let task = {
            let recorder = Arc::clone(&recorder);
            let cancel = cancel.clone();
            tokio::spawn(async move { run_agent(&ctx, recorder.as_ref(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, LoopExit::Cancelled));
        assert!(*recorder.heartbeats.lock() >= 2);
        assert!(!recorder.reports.lock().is_empty());
    }
}
