//! Filesystem helpers shared by agents and the backup store.

pub mod atomic;
pub mod metadata;
pub mod walker;

pub use atomic::write_atomic;
