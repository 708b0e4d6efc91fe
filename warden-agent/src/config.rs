//! Configuration management for the warden supervisor.
//!
//! Loads configuration from a TOML file. Every section has defaults so a
//! minimal file only needs `[policy]` and at least one `[[agents]]` entry.

use crate::utils::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Capability kinds the daemon knows how to build from configuration.
pub const AGENT_KINDS: &[&str] = &["tidy", "remote"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub changelog: ChangeLogConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// HTTP control surface port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Holds `backups/`, `changes.log` and `status.json`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How often `status.json` is rewritten
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// Upper bound on waiting for an agent to reach a safe point on stop
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Roots under which agents may mutate files
    #[serde(default)]
    pub safe_directories: Vec<PathBuf>,

    /// Glob patterns excluded even inside a safe directory
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Reasoning backend reachability URL (probe disabled when unset)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogConfig {
    /// fsync after every appended entry
    #[serde(default = "default_true")]
    pub sync_every_append: bool,

    /// Also record `Proposed` before each request is evaluated
    #[serde(default)]
    pub record_proposals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable agent identifier
    pub id: String,

    /// Capability kind, one of [`AGENT_KINDS`]
    pub kind: String,

    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Consecutive fatal failures tolerated before the agent is parked
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Directory the agent observes
    pub root: PathBuf,

    /// File extensions the agent considers (empty = all files)
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Rewrite endpoint, required by the `remote` kind
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Overrides the capability's own backend-dependence declaration
    #[serde(default)]
    pub backend_dependent: Option<bool>,

    /// Start with the daemon
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl AgentConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}

// Default values
fn default_port() -> u16 {
    9870
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_ms() -> u64 {
    2000
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cycle_interval_ms() -> u64 {
    60_000
}

fn default_retry_budget() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            status_interval_secs: default_status_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl DaemonConfig {
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.data_dir.join("changes.log")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            interval_secs: default_health_interval_secs(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            sync_every_append: true,
            record_proposals: false,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RestartConfig {
    /// Delay before restart number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            policy: PolicyConfig::default(),
            health: HealthConfig::default(),
            changelog: ChangeLogConfig::default(),
            restart: RestartConfig::default(),
            log: LogConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for dir in &self.policy.safe_directories {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "safe directory must be absolute: {}",
                    dir.display()
                )));
            }
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::Invalid("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent id: {}",
                    agent.id
                )));
            }
            if agent.retry_budget == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent {}: retry_budget must be at least 1",
                    agent.id
                )));
            }
            if agent.cycle_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent {}: cycle_interval_ms must be positive",
                    agent.id
                )));
            }
            if !AGENT_KINDS.contains(&agent.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "agent {}: unknown kind {:?} (expected one of {:?})",
                    agent.id, agent.kind, AGENT_KINDS
                )));
            }
            if agent.kind == "remote" && agent.endpoint.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "agent {}: kind \"remote\" needs an endpoint",
                    agent.id
                )));
            }
        }

        if self.restart.backoff_base_ms == 0 || self.restart.backoff_max_ms < self.restart.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "restart backoff must satisfy 0 < backoff_base_ms <= backoff_max_ms".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [daemon]
        data_dir = "/tmp/warden"

        [policy]
        safe_directories = ["/srv/ws"]
        denied_patterns = ["**/.git/**"]

        [[agents]]
        id = "tidy-docs"
        kind = "tidy"
        root = "/srv/ws/docs"
        extensions = ["md"]
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.daemon.port, 9870);
        assert_eq!(config.daemon.changelog_path(), PathBuf::from("/tmp/warden/changes.log"));
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].retry_budget, 3);
        assert_eq!(config.agents[0].cycle_interval(), Duration::from_secs(60));
        assert!(config.agents[0].autostart);
        assert!(config.changelog.sync_every_append);
        assert!(!config.changelog.record_proposals);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let toml = format!(
            "{}\n[[agents]]\nid = \"tidy-docs\"\nkind = \"tidy\"\nroot = \"/srv/ws\"\n",
            SAMPLE
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn test_rejects_relative_safe_directory() {
        let err = Config::from_toml("[policy]\nsafe_directories = [\"ws\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_kind_and_zero_budget() {
        let unknown = "[[agents]]\nid = \"a\"\nkind = \"oracle\"\nroot = \"/ws\"\n";
        assert!(Config::from_toml(unknown).is_err());

        let zero = "[[agents]]\nid = \"a\"\nkind = \"tidy\"\nroot = \"/ws\"\nretry_budget = 0\n";
        assert!(Config::from_toml(zero).is_err());

        let remote = "[[agents]]\nid = \"a\"\nkind = \"remote\"\nroot = \"/ws\"\n";
        assert!(Config::from_toml(remote).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let restart = RestartConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
        };
        assert_eq!(restart.backoff(1), Duration::from_millis(100));
        assert_eq!(restart.backoff(2), Duration::from_millis(200));
        assert_eq!(restart.backoff(3), Duration::from_millis(400));
        assert_eq!(restart.backoff(10), Duration::from_millis(1000));
    }
}
