//! Snapshot records as persisted under `backups/snapshots/`.

use crate::fs::metadata::FileMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One backup taken before one mutation attempt. Never modified after write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub original_path: PathBuf,
    /// SHA-256 of the uncompressed content, lowercase hex
    pub content_hash: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// `false` when the path did not exist; restoring removes it
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

/// `<sequence:012>-<sha256>`: sortable by capture order, carries the content hash.
pub fn format_snapshot_id(sequence: u64, content_hash: &str) -> String {
    format!("{:012}-{}", sequence, content_hash)
}

/// Extract the sequence prefix; `None` for anything that is not a snapshot id.
pub fn parse_snapshot_id(id: &str) -> Option<(u64, &str)> {
    let (seq, hash) = id.split_once('-')?;
    if seq.len() != 12 || hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((seq.parse().ok()?, hash))
}
