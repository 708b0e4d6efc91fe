//! Supervisor - owns the agent registry and each agent's lifecycle.
//!
//! `list` and `status` only read shared status and never wait on an agent.
//! `start` is synchronous. `stop` cancels first and then waits, bounded by
//! the stop timeout, for each agent to reach a safe point.

pub mod registry;
mod runner;
pub mod state;

pub use registry::AgentRegistry;
pub use state::{AgentState, AgentStatus, ControlResult};

use crate::agent::Capability;
use crate::config::{AgentConfig, RestartConfig};
use crate::executor::{AgentContext, MutationEngine};
use crate::health::HealthStatus;
use crate::utils::{ConfigError, Result, WardenError};
use chrono::Utc;
use registry::RunHandle;
use runner::AgentRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Supervisor {
    registry: AgentRegistry,
    engine: Arc<MutationEngine>,
    health: watch::Receiver<HealthStatus>,
    restart: RestartConfig,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        engine: Arc<MutationEngine>,
        health: watch::Receiver<HealthStatus>,
        restart: RestartConfig,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(),
            engine,
            health,
            restart,
            stop_timeout,
        }
    }

    pub fn register(&self, config: AgentConfig, capability: Arc<dyn Capability>) -> Result<()> {
        let id = config.id.clone();
        if !self.registry.register(config, capability) {
            return Err(ConfigError::Invalid(format!("duplicate agent id: {id}")).into());
        }
        info!(agent_id = %id, "Agent registered");
        Ok(())
    }

    pub fn engine(&self) -> &Arc<MutationEngine> {
        &self.engine
    }

    pub fn list(&self) -> Vec<AgentStatus> {
        self.registry.statuses()
    }

    /// One agent, or all of them when `target` is `None`
    pub fn status(&self, target: Option<&str>) -> Result<Vec<AgentStatus>> {
        match target {
            Some(id) => self
                .registry
                .status(id)
                .map(|status| vec![status])
                .ok_or_else(|| WardenError::UnknownAgent(id.to_string())),
            None => Ok(self.list()),
        }
    }

    /// Start one agent, or all of them. Already-running agents are left alone.
    pub fn start(&self, target: Option<&str>) -> Result<Vec<ControlResult>> {
        self.targets(target)?
            .iter()
            .map(|id| self.start_one(id))
            .collect()
    }

    /// Start every agent configured with `autostart`
    pub fn start_autostart(&self) -> Vec<ControlResult> {
        let mut results = Vec::new();
        for id in self.registry.ids() {
            let autostart = self
                .registry
                .get_mut(&id)
                .map(|slot| slot.config.autostart)
                .unwrap_or(false);
            if !autostart {
                continue;
            }
            match self.start_one(&id) {
                Ok(result) => results.push(result),
                Err(e) => error!(agent_id = %id, error = %e, "Failed to start agent"),
            }
        }
        results
    }

    /// Stop one agent, or all of them, letting in-flight mutations finish.
    pub async fn stop(&self, target: Option<&str>) -> Result<Vec<ControlResult>> {
        let mut results = Vec::new();
        let mut pending = Vec::new();

        // Cancel everything first so agents wind down in parallel
        for id in self.targets(target)? {
            let Some(mut slot) = self.registry.get_mut(&id) else {
                continue;
            };
            let status = Arc::clone(&slot.status);
            let previous = status.read().state;
            match slot.run.take() {
                Some(run) if !run.join.is_finished() => {
                    run.cancel.cancel();
                    pending.push((id, previous, status, run));
                }
                _ => results.push(ControlResult::unchanged(&id, previous)),
            }
        }

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        for (id, previous, status, run) in pending {
            match tokio::time::timeout_at(deadline, run.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(agent_id = %id, error = %e, "Agent task ended abnormally"),
                Err(_) => warn!(
                    agent_id = %id,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "Agent did not reach a safe point in time, it will stop after its current mutation"
                ),
            }

            let current = {
                let mut s = status.write();
                if s.generation == run.generation && !s.state.is_stopped() {
                    s.state = AgentState::Stopped;
                }
                s.state
            };
            info!(agent_id = %id, %previous, %current, "Agent stop requested");
            results.push(ControlResult::transition(&id, previous, current));
        }

        results.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(results)
    }

    fn targets(&self, target: Option<&str>) -> Result<Vec<String>> {
        match target {
            Some(id) if self.registry.contains(id) => Ok(vec![id.to_string()]),
            Some(id) => Err(WardenError::UnknownAgent(id.to_string())),
            None => Ok(self.registry.ids()),
        }
    }

    fn start_one(&self, id: &str) -> Result<ControlResult> {
        let mut slot = self
            .registry
            .get_mut(id)
            .ok_or_else(|| WardenError::UnknownAgent(id.to_string()))?;

        let previous = slot.status.read().state;
        if slot.run.as_ref().is_some_and(|run| !run.join.is_finished()) {
            return Ok(ControlResult::unchanged(id, previous));
        }

        let generation = {
            let mut s = slot.status.write();
            s.generation += 1;
            s.state = AgentState::Starting;
            s.started_at = Some(Utc::now());
            s.restart_count = 0;
            s.consecutive_failures = 0;
            s.needs_intervention = false;
            s.generation
        };

        let cancel = CancellationToken::new();
        let runner = AgentRunner {
            ctx: Arc::new(AgentContext {
                config: slot.config.clone(),
                capability: Arc::clone(&slot.capability),
                engine: Arc::clone(&self.engine),
                health: self.health.clone(),
            }),
            status: Arc::clone(&slot.status),
            generation,
            restart: self.restart.clone(),
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(runner.run());
        slot.run = Some(RunHandle {
            cancel,
            join,
            generation,
        });

        info!(agent_id = %id, generation, %previous, "Agent starting");
        Ok(ControlResult::transition(id, previous, AgentState::Starting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MutationRequest, Tidy, WorkspaceView};
    use crate::backup::BackupStore;
    use crate::changelog::{ChangeAction, ChangeLog};
    use crate::policy::SafeDirectoryPolicy;
    use async_trait::async_trait;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        safe: PathBuf,
        supervisor: Supervisor,
        health: watch::Sender<HealthStatus>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let safe = dir.path().join("safe");
        fs::create_dir_all(&safe).unwrap();
        let safe = fs::canonicalize(safe).unwrap();

        let data = dir.path().join("data");
        let policy = SafeDirectoryPolicy::load(&[safe.clone()], &[]).unwrap();
        let engine = Arc::new(MutationEngine::new(
            Arc::new(policy),
            Arc::new(BackupStore::open(&data.join("backups")).unwrap()),
            Arc::new(ChangeLog::open(&data.join("changes.log"), false).unwrap()),
            false,
        ));
        let (health, rx) = watch::channel(HealthStatus::default());
        let restart = RestartConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        };
        let supervisor = Supervisor::new(engine, rx, restart, Duration::from_secs(5));
        Harness {
            dir,
            safe,
            supervisor,
            health,
        }
    }

    fn agent_config(id: &str, root: &Path, retry_budget: u32) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            kind: "tidy".to_string(),
            cycle_interval_ms: 10,
            retry_budget,
            root: root.to_path_buf(),
            extensions: Vec::new(),
            endpoint: None,
            backend_dependent: None,
            autostart: true,
        }
    }

    async fn wait_for(supervisor: &Supervisor, id: &str, state: AgentState) -> AgentStatus {
        for _ in 0..500 {
            let status = supervisor.status(Some(id)).unwrap().remove(0);
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent {id} never reached {state}");
    }

    /// Tears the file, destroys the backups, fails: every request is a
    /// rollback failure.
    struct Breaker {
        target: PathBuf,
        objects: PathBuf,
        applies: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for Breaker {
        fn name(&self) -> &str {
            "breaker"
        }

        async fn propose(&self, _view: &WorkspaceView) -> crate::utils::Result<Vec<MutationRequest>> {
            Ok(vec![MutationRequest::new(&self.target, "new content\n")])
        }

        fn apply(&self, request: &MutationRequest) -> std::io::Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            fs::write(&request.path, b"n")?;
            for entry in fs::read_dir(&self.objects)? {
                fs::remove_file(entry?.path())?;
            }
            Err(std::io::Error::other("device lost"))
        }
    }

    struct Panicker;

    #[async_trait]
    impl Capability for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn propose(&self, _view: &WorkspaceView) -> crate::utils::Result<Vec<MutationRequest>> {
            panic!("capability bug");
        }
    }

    /// One slow write per cycle
    struct Slow {
        target: PathBuf,
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Capability for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn propose(&self, _view: &WorkspaceView) -> crate::utils::Result<Vec<MutationRequest>> {
            Ok(vec![MutationRequest::new(&self.target, "slow\n")])
        }

        fn apply(&self, request: &MutationRequest) -> std::io::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            crate::agent::write_in_place(&request.path, &request.new_content)
        }
    }

    struct NeedsBackend {
        target: PathBuf,
    }

    #[async_trait]
    impl Capability for NeedsBackend {
        fn name(&self) -> &str {
            "needs-backend"
        }

        fn requires_backend(&self) -> bool {
            true
        }

        async fn propose(&self, _view: &WorkspaceView) -> crate::utils::Result<Vec<MutationRequest>> {
            Ok(vec![MutationRequest::new(&self.target, "backend says hi\n")])
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness();
        h.supervisor
            .register(agent_config("tidy", &h.safe, 3), Arc::new(Tidy::new()))
            .unwrap();

        let first = h.supervisor.start(Some("tidy")).unwrap();
        assert!(first[0].changed);
        assert_eq!(first[0].current, AgentState::Starting);

        let status = wait_for(&h.supervisor, "tidy", AgentState::Running).await;
        assert!(status.last_heartbeat.is_some());

        let again = h.supervisor.start(Some("tidy")).unwrap();
        assert!(!again[0].changed);

        let stopped = h.supervisor.stop(Some("tidy")).await.unwrap();
        assert!(stopped[0].changed);
        assert_eq!(stopped[0].current, AgentState::Stopped);

        let stopped_again = h.supervisor.stop(Some("tidy")).await.unwrap();
        assert!(!stopped_again[0].changed);
        assert_eq!(stopped_again[0].current, AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.supervisor.start(Some("ghost")),
            Err(WardenError::UnknownAgent(_))
        ));
        assert!(matches!(
            h.supervisor.status(Some("ghost")),
            Err(WardenError::UnknownAgent(_))
        ));
        assert!(h.supervisor.stop(Some("ghost")).await.is_err());
        assert!(h.supervisor.register(agent_config("a", &h.safe, 1), Arc::new(Tidy::new())).is_ok());
        assert!(h.supervisor.register(agent_config("a", &h.safe, 1), Arc::new(Tidy::new())).is_err());
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_parks_agent() {
        let h = harness();
        let target = h.safe.join("victim.txt");
        fs::write(&target, "original\n").unwrap();
        let applies = Arc::new(AtomicUsize::new(0));
        let breaker = Breaker {
            target: target.clone(),
            objects: h.dir.path().join("data/backups/objects"),
            applies: Arc::clone(&applies),
        };
        h.supervisor
            .register(agent_config("breaker", &h.safe, 3), Arc::new(breaker))
            .unwrap();

        h.supervisor.start(Some("breaker")).unwrap();
        let status = wait_for(&h.supervisor, "breaker", AgentState::StoppedByError).await;

        assert!(status.state.is_stopped());
        assert!(status.needs_intervention);
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.restart_count, 2);
        assert!(status.last_error.as_deref().unwrap().contains("restore"));

        // No fourth attempt
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(applies.load(Ordering::SeqCst), 3);

        let entries = h.supervisor.engine().changelog().entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.action == ChangeAction::RollbackFailed));

        // Stopping a parked agent is a no-op; a manual start clears the mark
        let stop = h.supervisor.stop(Some("breaker")).await.unwrap();
        assert!(!stop[0].changed);
        let start = h.supervisor.start(Some("breaker")).unwrap();
        assert_eq!(start[0].previous, AgentState::StoppedByError);
        let status = h.supervisor.status(Some("breaker")).unwrap().remove(0);
        assert!(!status.needs_intervention);
        h.supervisor.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_capability_counts_as_failure() {
        let h = harness();
        h.supervisor
            .register(agent_config("panicker", &h.safe, 1), Arc::new(Panicker))
            .unwrap();

        h.supervisor.start(Some("panicker")).unwrap();
        let status = wait_for(&h.supervisor, "panicker", AgentState::StoppedByError).await;

        assert!(status.last_error.as_deref().unwrap().contains("capability bug"));
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_mutation() {
        let h = harness();
        let target = h.safe.join("slow.txt");
        let started = Arc::new(AtomicBool::new(false));
        let slow = Slow {
            target: target.clone(),
            started: Arc::clone(&started),
        };
        h.supervisor
            .register(agent_config("slow", &h.safe, 3), Arc::new(slow))
            .unwrap();

        h.supervisor.start(Some("slow")).unwrap();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let results = h.supervisor.stop(Some("slow")).await.unwrap();

        assert_eq!(results[0].current, AgentState::Stopped);
        assert_eq!(fs::read_to_string(&target).unwrap(), "slow\n");
        let entries = h.supervisor.engine().changelog().entries().unwrap();
        assert_eq!(entries.last().unwrap().action, ChangeAction::Applied);
    }

    #[tokio::test]
    async fn test_stop_timeout_detaches_run_without_clobbering_restart() {
        let mut h = harness();
        h.supervisor.stop_timeout = Duration::from_millis(20);
        let target = h.safe.join("slow.txt");
        let started = Arc::new(AtomicBool::new(false));
        let slow = Slow {
            target: target.clone(),
            started: Arc::clone(&started),
        };
        h.supervisor
            .register(agent_config("slow", &h.safe, 3), Arc::new(slow))
            .unwrap();

        h.supervisor.start(Some("slow")).unwrap();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Returns long before the 200ms write completes
        let stopped = h.supervisor.stop(Some("slow")).await.unwrap();
        assert!(stopped[0].changed);
        assert_eq!(stopped[0].current, AgentState::Stopped);

        let restarted = h.supervisor.start(Some("slow")).unwrap();
        assert!(restarted[0].changed);
        assert_eq!(restarted[0].current, AgentState::Starting);

        // The detached write still runs to its log entry
        let mut logged = false;
        for _ in 0..200 {
            let entries = h.supervisor.engine().changelog().entries().unwrap();
            if entries.iter().any(|e| e.action == ChangeAction::Applied) {
                logged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(logged);
        assert_eq!(fs::read_to_string(&target).unwrap(), "slow\n");

        // The old run has wound down by now; the new one owns the status
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = h.supervisor.status(Some("slow")).unwrap().remove(0);
        assert_eq!(status.state, AgentState::Running);
        assert_eq!(status.generation, 2);
        assert!(!status.needs_intervention);
    }

    #[tokio::test]
    async fn test_backend_dependent_agent_idles_while_backend_down() {
        let h = harness();
        let target = h.safe.join("remote.txt");
        h.supervisor
            .register(
                agent_config("remote", &h.safe, 3),
                Arc::new(NeedsBackend {
                    target: target.clone(),
                }),
            )
            .unwrap();

        h.supervisor.start(None).unwrap();
        wait_for(&h.supervisor, "remote", AgentState::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!target.exists());
        assert!(h.supervisor.engine().changelog().entries().unwrap().is_empty());
        let status = h.supervisor.status(Some("remote")).unwrap().remove(0);
        assert!(status.cycles > 0);
        assert_eq!(status.state, AgentState::Running);

        // Backend comes back: the next cycle goes through
        h.health.send_modify(|s| s.backend_reachable = true);
        for _ in 0..200 {
            if target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fs::read_to_string(&target).unwrap(), "backend says hi\n");

        h.supervisor.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_autostart_respects_flag() {
        let h = harness();
        let mut manual = agent_config("manual", &h.safe, 3);
        manual.autostart = false;
        h.supervisor.register(manual, Arc::new(Tidy::new())).unwrap();
        h.supervisor
            .register(agent_config("auto", &h.safe, 3), Arc::new(Tidy::new()))
            .unwrap();

        let started = h.supervisor.start_autostart();

        assert_eq!(started.len(), 1);
        assert_eq!(started[0].agent_id, "auto");
        let list = h.supervisor.list();
        assert_eq!(list[1].id, "manual");
        assert_eq!(list[1].state, AgentState::Stopped);
        h.supervisor.stop(None).await.unwrap();
    }
}
