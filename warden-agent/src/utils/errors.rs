//! Error types for the warden agent supervisor.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Change log error: {0}")]
    ChangeLog(#[from] ChangeLogError),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Raised while loading a policy. Evaluation itself never errors.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("safe directory must be absolute: {0}")]
    RelativeRoot(PathBuf),

    #[error("safe directory {root} cannot be resolved: {source}")]
    RootUnavailable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protected directory {dir} cannot be resolved: {source}")]
    ProtectedUnavailable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid deny pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("backup I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

impl BackupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChangeLogError {
    #[error("change log I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("change log serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("no backend endpoint configured")]
    NotConfigured,

    #[error("backend did not answer within {0}ms")]
    Timeout(u64),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend answered with status {0}")]
    Status(u16),
}

/// Failure kinds of a single mutation request.
///
/// `RollbackFailure` and `AuditFailure` are fatal for the agent that issued
/// the request; every other kind is recorded and the cycle moves on.
#[derive(Error, Debug)]
pub enum MutationError {
    #[error("outside safe scope: {0}")]
    PolicyViolation(PathBuf),

    #[error("backup failed: {0}")]
    BackupFailure(#[source] BackupError),

    #[error("write failed: {0}")]
    ApplyFailure(#[source] std::io::Error),

    #[error("restore of {snapshot_id} failed after write error ({apply}): {restore}")]
    RollbackFailure {
        snapshot_id: String,
        apply: String,
        #[source]
        restore: BackupError,
    },

    #[error("change log append failed: {0}")]
    AuditFailure(#[source] ChangeLogError),
}

impl MutationError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MutationError::RollbackFailure { .. } | MutationError::AuditFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
