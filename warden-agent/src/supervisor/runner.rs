//! Restart policy around the agent work loop.

use super::state::{AgentState, AgentStatus};
use crate::config::RestartConfig;
use crate::executor::{run_agent, AgentContext, AgentFailure, CycleReport, LoopExit, LoopObserver};
use chrono::Utc;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Writes loop signals into the shared status, as long as this run is still
/// the current one. A run superseded by a newer start goes quiet.
pub(crate) struct StatusObserver {
    status: Arc<RwLock<AgentStatus>>,
    generation: u64,
}

impl StatusObserver {
    fn update<R>(&self, f: impl FnOnce(&mut AgentStatus) -> R) -> Option<R> {
        let mut status = self.status.write();
        if status.generation != self.generation {
            return None;
        }
        Some(f(&mut status))
    }
}

impl LoopObserver for StatusObserver {
    fn heartbeat(&self) {
        let promoted = self.update(|s| {
            s.last_heartbeat = Some(Utc::now());
            if s.state == AgentState::Starting {
                s.state = AgentState::Running;
                true
            } else {
                false
            }
        });
        if promoted == Some(true) {
            let id = self.status.read().id.clone();
            info!(agent_id = %id, "Agent running");
        }
    }

    fn cycle_completed(&self, report: &CycleReport) {
        self.update(|s| {
            s.cycles += 1;
            s.applied += report.applied as u64;
            s.rejected += report.rejected as u64;
            s.rolled_back += report.rolled_back as u64;
            s.consecutive_failures = 0;
        });
    }
}

pub(crate) struct AgentRunner {
    pub ctx: Arc<AgentContext>,
    pub status: Arc<RwLock<AgentStatus>>,
    pub generation: u64,
    pub restart: RestartConfig,
    pub cancel: CancellationToken,
}

impl AgentRunner {
    pub async fn run(self) {
        let id = self.ctx.id().to_string();
        let budget = self.ctx.config.retry_budget;
        let observer = Arc::new(StatusObserver {
            status: Arc::clone(&self.status),
            generation: self.generation,
        });

        loop {
            // Each attempt runs in its own task so a panicking capability
            // surfaces as a failure instead of taking the runner down.
            let attempt = {
                let ctx = Arc::clone(&self.ctx);
                let observer = Arc::clone(&observer);
                let cancel = self.cancel.clone();
                tokio::spawn(async move { run_agent(&ctx, observer.as_ref(), &cancel).await })
            };
            let exit = match attempt.await {
                Ok(exit) => exit,
                Err(e) if e.is_panic() => {
                    LoopExit::Failed(AgentFailure::Panicked(panic_message(e.into_panic())))
                }
                Err(_) => LoopExit::Cancelled,
            };

            let failure = match exit {
                LoopExit::Cancelled => {
                    observer.update(|s| s.state = AgentState::Stopped);
                    info!(agent_id = %id, "Agent stopped");
                    return;
                }
                LoopExit::Failed(failure) => failure,
            };

            let Some(failures) = observer.update(|s| {
                s.consecutive_failures += 1;
                s.last_error = Some(failure.to_string());
                s.state = AgentState::Failing;
                s.consecutive_failures
            }) else {
                return;
            };

            if failures >= budget {
                observer.update(|s| {
                    s.state = AgentState::StoppedByError;
                    s.needs_intervention = true;
                });
                error!(
                    agent_id = %id,
                    failures,
                    retry_budget = budget,
                    error = %failure,
                    "Retry budget exhausted, agent needs manual intervention"
                );
                return;
            }

            let delay = self.restart.backoff(failures);
            warn!(
                agent_id = %id,
                failures,
                retry_budget = budget,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Agent failed, restarting after backoff"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    observer.update(|s| s.state = AgentState::Stopped);
                    info!(agent_id = %id, "Agent stopped during backoff");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            observer.update(|s| {
                s.restart_count += 1;
                s.state = AgentState::Starting;
            });
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
