//! Utility modules for the warden agent.

pub mod errors;
pub mod logger;

pub use errors::{
    BackupError, ChangeLogError, ConfigError, MutationError, PolicyError, ProbeError, Result,
    WardenError,
};
