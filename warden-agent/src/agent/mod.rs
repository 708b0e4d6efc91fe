//! The agent capability contract.
//!
//! A capability decides *what* to change (`propose`) and how bytes reach the
//! disk (`apply`). It never decides *when*: the executor pipeline gates every
//! request through the policy, takes the snapshot, calls `apply`, and records
//! the outcome.

pub mod remote;
pub mod tidy;

pub use remote::Remote;
pub use tidy::Tidy;

use crate::config::AgentConfig;
use crate::fs::walker::{walk_files, FileInfo, WalkOptions};
use crate::health::HealthStatus;
use crate::utils::{ConfigError, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Replace the content of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    /// Absolute, or relative to the agent root
    pub path: PathBuf,
    pub new_content: Vec<u8>,
}

impl MutationRequest {
    pub fn new(path: impl Into<PathBuf>, new_content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            new_content: new_content.into(),
        }
    }
}

/// What an agent gets to look at for one cycle.
#[derive(Debug, Clone)]
pub struct WorkspaceView {
    pub agent_id: String,
    pub root: PathBuf,
    pub cycle: u64,
    pub health: HealthStatus,
    pub walk: WalkOptions,
}

impl WorkspaceView {
    /// Regular files under the agent root that pass the walk filters
    pub fn files(&self) -> Result<Vec<FileInfo>> {
        Ok(walk_files(&self.root, &self.walk)?)
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Backend-dependent capabilities are not asked to propose while the
    /// reasoning backend is unreachable.
    fn requires_backend(&self) -> bool {
        false
    }

    /// Mutations for this cycle, applied in order.
    async fn propose(&self, view: &WorkspaceView) -> Result<Vec<MutationRequest>>;

    /// Write the new content. Runs only after a successful snapshot.
    fn apply(&self, request: &MutationRequest) -> std::io::Result<()> {
        write_in_place(&request.path, &request.new_content)
    }
}

/// Truncate and rewrite `path`, then fsync it.
///
/// A failure part-way leaves the file torn; callers restore from the
/// snapshot taken beforehand.
pub fn write_in_place(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Build the capability named by `config.kind`
pub fn build_capability(config: &AgentConfig) -> Result<Arc<dyn Capability>> {
    match config.kind.as_str() {
        "tidy" => Ok(Arc::new(Tidy::new())),
        "remote" => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("agent {}: remote agents need an endpoint", config.id))
            })?;
            Ok(Arc::new(Remote::new(endpoint)?))
        }
        other => Err(ConfigError::Invalid(format!("unknown agent kind: {other}")).into()),
    }
}

/// Walk options for an agent: defaults plus its extension filter
pub fn walk_options(config: &AgentConfig) -> WalkOptions {
    WalkOptions::default().with_extensions(&config.extensions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn agent_config(kind: &str, endpoint: Option<&str>) -> AgentConfig {
        AgentConfig {
            id: "a1".to_string(),
            kind: kind.to_string(),
            cycle_interval_ms: 1000,
            retry_budget: 3,
            root: PathBuf::from("/ws"),
            extensions: vec!["md".to_string()],
            endpoint: endpoint.map(str::to_string),
            backend_dependent: None,
            autostart: true,
        }
    }

    #[test]
    fn test_build_known_kinds() {
        let tidy = build_capability(&agent_config("tidy", None)).unwrap();
        assert_eq!(tidy.name(), "tidy");
        assert!(!tidy.requires_backend());

        let remote =
            build_capability(&agent_config("remote", Some("http://127.0.0.1:1/rewrite"))).unwrap();
        assert_eq!(remote.name(), "remote");
        assert!(remote.requires_backend());
    }

    #[test]
    fn test_build_rejects_bad_configs() {
        assert!(build_capability(&agent_config("remote", None)).is_err());
        assert!(build_capability(&agent_config("oracle", None)).is_err());
    }

    #[test]
    fn test_write_in_place_truncates() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"a much longer original")?;

        write_in_place(&path, b"short")?;

        assert_eq!(std::fs::read(&path)?, b"short");
        Ok(())
    }
}
