//! The gated mutation sequence every request goes through.
//!
//! policy check → snapshot → apply → (restore on failure) → change log
//!
//! Requests on the same resolved path are serialized across all agents; a
//! request finishes its whole sequence before the next one on that path
//! starts.

use crate::agent::{Capability, MutationRequest};
use crate::backup::{BackupStore, SnapshotRecord};
use crate::changelog::{ChangeAction, ChangeEntry, ChangeLog};
use crate::policy::{SafeDirectoryPolicy, Verdict};
use crate::utils::{BackupError, ChangeLogError, MutationError};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A request that made it all the way to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub path: PathBuf,
    pub snapshot_id: String,
}

pub struct MutationEngine {
    policy: Arc<SafeDirectoryPolicy>,
    backups: Arc<BackupStore>,
    changelog: Arc<ChangeLog>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    record_proposals: bool,
}

impl MutationEngine {
    pub fn new(
        policy: Arc<SafeDirectoryPolicy>,
        backups: Arc<BackupStore>,
        changelog: Arc<ChangeLog>,
        record_proposals: bool,
    ) -> Self {
        Self {
            policy,
            backups,
            changelog,
            path_locks: DashMap::new(),
            record_proposals,
        }
    }

    pub fn policy(&self) -> &SafeDirectoryPolicy {
        &self.policy
    }

    pub fn backups(&self) -> &Arc<BackupStore> {
        &self.backups
    }

    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    /// Run one request through the full sequence.
    ///
    /// Every outcome, success or not, leaves exactly one terminal entry in
    /// the change log. A request whose entry cannot be appended fails with
    /// [`MutationError::AuditFailure`] and leaves the path as it was.
    pub async fn execute(
        &self,
        agent_id: &str,
        capability: &Arc<dyn Capability>,
        request: MutationRequest,
        root: &Path,
    ) -> Result<Applied, MutationError> {
        let requested = if request.path.is_absolute() {
            request.path.clone()
        } else {
            root.join(&request.path)
        };

        if self.record_proposals {
            self.record(ChangeEntry::new(agent_id, &requested, ChangeAction::Proposed))
                .await?;
        }

        let resolved = match self.policy.evaluate(&requested) {
            Verdict::Mutable(resolved) => resolved,
            verdict => {
                let reason = verdict.reason();
                warn!(agent_id, path = %requested.display(), %reason, "Mutation rejected");
                self.record(
                    ChangeEntry::new(agent_id, &requested, ChangeAction::Rejected).with_reason(&reason),
                )
                .await?;
                return Err(MutationError::PolicyViolation(requested));
            }
        };

        let lock = self
            .path_locks
            .entry(resolved.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        let result = self.snapshot_and_apply(agent_id, capability, request, &resolved).await;

        drop(guard);
        self.path_locks
            .remove_if(&resolved, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn snapshot_and_apply(
        &self,
        agent_id: &str,
        capability: &Arc<dyn Capability>,
        request: MutationRequest,
        resolved: &Path,
    ) -> Result<Applied, MutationError> {
        let snapshot = match self.snapshot(resolved).await {
            Ok(record) => record,
            Err(e) => {
                warn!(agent_id, path = %resolved.display(), error = %e, "Snapshot failed, skipping mutation");
                self.record(
                    ChangeEntry::new(agent_id, resolved, ChangeAction::Rejected)
                        .with_reason(format!("backup failed: {e}")),
                )
                .await?;
                return Err(MutationError::BackupFailure(e));
            }
        };
        let snapshot_id = snapshot.snapshot_id;

        let request = MutationRequest {
            path: resolved.to_path_buf(),
            new_content: request.new_content,
        };
        let cap = Arc::clone(capability);
        let written = tokio::task::spawn_blocking(move || cap.apply(&request))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(format!("apply task failed: {e}"))));

        let apply_err = match written {
            Ok(()) => {
                let entry = ChangeEntry::new(agent_id, resolved, ChangeAction::Applied)
                    .with_snapshot(&snapshot_id);
                if let Err(audit) = self.record(entry).await {
                    // Unlogged bytes must not stay on disk
                    if let Err(restore_err) = self.restore(&snapshot_id).await {
                        error!(
                            agent_id,
                            path = %resolved.display(),
                            %snapshot_id,
                            error = %restore_err,
                            "Change log unavailable and restore failed"
                        );
                    }
                    return Err(audit);
                }
                info!(agent_id, path = %resolved.display(), %snapshot_id, "Mutation applied");
                return Ok(Applied {
                    path: resolved.to_path_buf(),
                    snapshot_id,
                });
            }
            Err(e) => e,
        };

        match self.restore(&snapshot_id).await {
            Ok(_) => {
                warn!(agent_id, path = %resolved.display(), %snapshot_id, error = %apply_err, "Write failed, rolled back");
                self.record(
                    ChangeEntry::new(agent_id, resolved, ChangeAction::RolledBack)
                        .with_snapshot(&snapshot_id)
                        .with_reason(format!("write failed: {apply_err}")),
                )
                .await?;
                Err(MutationError::ApplyFailure(apply_err))
            }
            Err(restore_err) => {
                error!(
                    agent_id,
                    path = %resolved.display(),
                    %snapshot_id,
                    apply_error = %apply_err,
                    restore_error = %restore_err,
                    "Write failed and rollback failed"
                );
                // Already fatal; a lost entry is reported but does not mask the torn path
                let _ = self
                    .record(
                        ChangeEntry::new(agent_id, resolved, ChangeAction::RollbackFailed)
                            .with_snapshot(&snapshot_id)
                            .with_reason(format!(
                                "write failed: {apply_err}; restore failed: {restore_err}"
                            )),
                    )
                    .await;
                Err(MutationError::RollbackFailure {
                    snapshot_id,
                    apply: apply_err.to_string(),
                    restore: restore_err,
                })
            }
        }
    }

    async fn snapshot(&self, path: &Path) -> Result<SnapshotRecord, BackupError> {
        let backups = Arc::clone(&self.backups);
        let path = path.to_path_buf();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || backups.snapshot(&task_path))
            .await
            .unwrap_or_else(|e| Err(BackupError::io(path, std::io::Error::other(e.to_string()))))
    }

    async fn restore(&self, snapshot_id: &str) -> Result<SnapshotRecord, BackupError> {
        let backups = Arc::clone(&self.backups);
        let id = snapshot_id.to_string();
        tokio::task::spawn_blocking(move || backups.restore(&id))
            .await
            .unwrap_or_else(|e| {
                Err(BackupError::Corrupt {
                    id: snapshot_id.to_string(),
                    reason: format!("restore task failed: {e}"),
                })
            })
    }

    /// Append on the blocking pool; the append may fsync.
    async fn record(&self, entry: ChangeEntry) -> Result<(), MutationError> {
        let changelog = Arc::clone(&self.changelog);
        let appended = tokio::task::spawn_blocking(move || changelog.append(entry))
            .await
            .unwrap_or_else(|e| {
                Err(ChangeLogError::Io(std::io::Error::other(format!(
                    "append task failed: {e}"
                ))))
            });

        match appended {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "Failed to append to change log");
                Err(MutationError::AuditFailure(e))
            }
        }
    }
}
