//! Change log entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Proposed,
    Applied,
    RolledBack,
    Rejected,
    /// The write failed and restoring the snapshot failed too
    RollbackFailed,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Proposed => "proposed",
            ChangeAction::Applied => "applied",
            ChangeAction::RolledBack => "rolled_back",
            ChangeAction::Rejected => "rejected",
            ChangeAction::RollbackFailed => "rollback_failed",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Assigned by the log on append
    pub seq: u64,
    /// Assigned by the log on append
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub path: PathBuf,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChangeEntry {
    pub fn new(agent_id: &str, path: &Path, action: ChangeAction) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            path: path.to_path_buf(),
            action,
            snapshot_id: None,
            reason: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:<6} {} {:<16} {:<15} {}",
            self.seq,
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.agent_id,
            self.action,
            self.path.display()
        )?;
        if let Some(snapshot_id) = &self.snapshot_id {
            write!(f, " snapshot={snapshot_id}")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " reason={reason:?}")?;
        }
        Ok(())
    }
}
