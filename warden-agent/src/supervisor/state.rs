use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a supervised agent.
///
/// ```text
/// Stopped ──start──▶ Starting ──heartbeat──▶ Running
///    ▲                  ▲                       │ fatal error
///    │ stop             │ backoff elapsed       ▼
///    └──────────────────┴─────────────────── Failing ──budget spent──▶ StoppedByError
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Failing,
    /// Retry budget exhausted; only a manual start brings it back
    StoppedByError,
}

impl AgentState {
    pub fn is_stopped(self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::StoppedByError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Failing => "failing",
            AgentState::StoppedByError => "stopped_by_error",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Point-in-time view of one agent, as reported by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: String,
    pub kind: String,
    pub state: AgentState,
    /// Identifies the current run; bumps on every manual start
    pub generation: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub retry_budget: u32,
    pub last_error: Option<String>,
    pub needs_intervention: bool,
    pub cycles: u64,
    pub applied: u64,
    pub rejected: u64,
    pub rolled_back: u64,
}

impl AgentStatus {
    pub fn new(id: &str, kind: &str, retry_budget: u32) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            state: AgentState::Stopped,
            generation: 0,
            last_heartbeat: None,
            started_at: None,
            restart_count: 0,
            consecutive_failures: 0,
            retry_budget,
            last_error: None,
            needs_intervention: false,
            cycles: 0,
            applied: 0,
            rejected: 0,
            rolled_back: 0,
        }
    }
}

/// Result of a start or stop request for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResult {
    pub agent_id: String,
    pub previous: AgentState,
    pub current: AgentState,
    /// False when the request was a no-op
    pub changed: bool,
}

impl ControlResult {
    pub fn unchanged(agent_id: &str, state: AgentState) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            previous: state,
            current: state,
            changed: false,
        }
    }

    pub fn transition(agent_id: &str, previous: AgentState, current: AgentState) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            previous,
            current,
            changed: previous != current,
        }
    }
}
