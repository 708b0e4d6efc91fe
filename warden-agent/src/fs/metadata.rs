//! File metadata captured alongside snapshots.
//!
//! Only what a restore needs to put back: size, mtime for display, and the
//! unix permission bits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path (follows symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };

        #[cfg(not(unix))]
        let mode = None;

        Ok(Self {
            size: metadata.len(),
            modified,
            mode,
        })
    }

    /// Reapply the recorded permission bits to `path`
    #[cfg(unix)]
    pub fn apply_permissions(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = self.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_permissions(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}
