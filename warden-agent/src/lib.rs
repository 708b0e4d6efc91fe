//! Warden Agent Library
//!
//! Supervises long-running agents that rewrite files unattended. Every
//! mutation is confined to safe directories, snapshotted beforehand, and
//! recorded in an append-only change log.

pub mod agent;
pub mod api;
pub mod backup;
pub mod changelog;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod health;
pub mod policy;
pub mod status;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::WardenError;
pub use utils::Result;
