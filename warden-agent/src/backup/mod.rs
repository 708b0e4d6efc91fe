//! Content-addressed snapshot store.
//!
//! Layout under the store root:
//! - `objects/<sha256>`: zstd-compressed content, written once per distinct hash
//! - `snapshots/<snapshot_id>.json`: one [`SnapshotRecord`] per snapshot
//!
//! `snapshot` returns only after both files are durable, so a caller may
//! mutate the original as soon as it has a record in hand.

pub mod record;

pub use record::{format_snapshot_id, parse_snapshot_id, SnapshotRecord};

use crate::fs::metadata::FileMetadata;
use crate::fs::write_atomic;
use crate::utils::BackupError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub snapshots: usize,
    pub objects: usize,
    /// Compressed bytes on disk across all objects
    pub stored_bytes: u64,
    pub latest_sequence: u64,
}

pub struct BackupStore {
    root: PathBuf,
    objects_dir: PathBuf,
    snapshots_dir: PathBuf,
    sequence: AtomicU64,
    write_lock: Mutex<()>,
}

impl BackupStore {
    /// Open (or create) a store and resume its sequence from disk
    pub fn open(root: &Path) -> Result<Self, BackupError> {
        let objects_dir = root.join("objects");
        let snapshots_dir = root.join("snapshots");
        for dir in [&objects_dir, &snapshots_dir] {
            std::fs::create_dir_all(dir).map_err(|e| BackupError::io(dir, e))?;
        }

        let latest = list_snapshot_ids(&snapshots_dir)?
            .iter()
            .filter_map(|id| parse_snapshot_id(id).map(|(seq, _)| seq))
            .max()
            .unwrap_or(0);

        info!(root = %root.display(), latest_sequence = latest, "Backup store opened");

        Ok(Self {
            root: root.to_path_buf(),
            objects_dir,
            snapshots_dir,
            sequence: AtomicU64::new(latest),
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capture the current content of `path`.
    ///
    /// A missing file is captured as absent. Repeated identical content
    /// reuses the stored object but always yields a fresh record.
    pub fn snapshot(&self, path: &Path) -> Result<SnapshotRecord, BackupError> {
        let _guard = self.write_lock.lock();

        let (content, existed) = match std::fs::read(path) {
            Ok(content) => (content, true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (Vec::new(), false),
            Err(e) => return Err(BackupError::io(path, e)),
        };
        let metadata = if existed {
            Some(FileMetadata::from_path(path).map_err(|e| BackupError::io(path, e))?)
        } else {
            None
        };

        let content_hash = hex::encode(Sha256::digest(&content));
        self.store_object(&content_hash, &content)?;

        let sequence = self.sequence.load(Ordering::SeqCst) + 1;
        let record = SnapshotRecord {
            snapshot_id: format_snapshot_id(sequence, &content_hash),
            original_path: path.to_path_buf(),
            content_hash,
            sequence,
            captured_at: Utc::now(),
            size_bytes: content.len() as u64,
            existed,
            metadata,
        };

        let record_path = self.record_path(&record.snapshot_id);
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| BackupError::io(&record_path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        write_atomic(&record_path, &json).map_err(|e| BackupError::io(&record_path, e))?;
        self.sequence.store(sequence, Ordering::SeqCst);

        debug!(
            snapshot_id = %record.snapshot_id,
            path = %path.display(),
            size_bytes = record.size_bytes,
            existed,
            "Snapshot captured"
        );
        Ok(record)
    }

    /// Put the original path back to the captured bytes (or remove it if it
    /// was absent at capture time).
    pub fn restore(&self, snapshot_id: &str) -> Result<SnapshotRecord, BackupError> {
        let record = self.record(snapshot_id)?;
        let target = &record.original_path;

        if !record.existed {
            match std::fs::remove_file(target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackupError::io(target, e)),
            }
            info!(snapshot_id, path = %target.display(), "Restored absent file");
            return Ok(record);
        }

        let content = self.load_object(&record)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        write_atomic(target, &content).map_err(|e| BackupError::io(target, e))?;
        if let Some(metadata) = &record.metadata {
            metadata
                .apply_permissions(target)
                .map_err(|e| BackupError::io(target, e))?;
        }

        info!(snapshot_id, path = %target.display(), bytes = content.len(), "Snapshot restored");
        Ok(record)
    }

    /// Load one record without touching the workspace
    pub fn record(&self, snapshot_id: &str) -> Result<SnapshotRecord, BackupError> {
        if parse_snapshot_id(snapshot_id).is_none() {
            return Err(BackupError::NotFound(snapshot_id.to_string()));
        }

        let path = self.record_path(snapshot_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(snapshot_id.to_string()))
            }
            Err(e) => return Err(BackupError::io(&path, e)),
        };

        serde_json::from_slice(&bytes).map_err(|e| BackupError::Corrupt {
            id: snapshot_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// All snapshots taken of `path`, oldest first
    pub fn history(&self, path: &Path) -> Result<Vec<SnapshotRecord>, BackupError> {
        let mut records = Vec::new();
        for id in list_snapshot_ids(&self.snapshots_dir)? {
            let record = self.record(&id)?;
            if record.original_path == path {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<BackupStats, BackupError> {
        let snapshots = list_snapshot_ids(&self.snapshots_dir)?.len();

        let mut objects = 0;
        let mut stored_bytes = 0;
        let entries =
            std::fs::read_dir(&self.objects_dir).map_err(|e| BackupError::io(&self.objects_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.objects_dir, e))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            objects += 1;
            stored_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }

        Ok(BackupStats {
            snapshots,
            objects,
            stored_bytes,
            latest_sequence: self.sequence.load(Ordering::SeqCst),
        })
    }

    fn store_object(&self, content_hash: &str, content: &[u8]) -> Result<(), BackupError> {
        let path = self.objects_dir.join(content_hash);
        if path.exists() {
            debug!(content_hash, "Object already stored, reusing");
            return Ok(());
        }

        let compressed =
            zstd::encode_all(content, ZSTD_LEVEL).map_err(|e| BackupError::io(&path, e))?;
        write_atomic(&path, &compressed).map_err(|e| BackupError::io(&path, e))
    }

    fn load_object(&self, record: &SnapshotRecord) -> Result<Vec<u8>, BackupError> {
        let corrupt = |reason: String| BackupError::Corrupt {
            id: record.snapshot_id.clone(),
            reason,
        };

        let path = self.objects_dir.join(&record.content_hash);
        let compressed = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(corrupt("content object missing".to_string()))
            }
            Err(e) => return Err(BackupError::io(&path, e)),
        };

        let content = zstd::decode_all(compressed.as_slice())
            .map_err(|e| corrupt(format!("decompression failed: {e}")))?;
        let actual = hex::encode(Sha256::digest(&content));
        if actual != record.content_hash {
            return Err(corrupt(format!("content hash mismatch (found {actual})")));
        }
        Ok(content)
    }

    fn record_path(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{snapshot_id}.json"))
    }
}

fn list_snapshot_ids(dir: &Path) -> Result<Vec<String>, BackupError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| BackupError::io(dir, e))? {
        let entry = entry.map_err(|e| BackupError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(id) = name.strip_suffix(".json") {
            if parse_snapshot_id(id).is_some() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
