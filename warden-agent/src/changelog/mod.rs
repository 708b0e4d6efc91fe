//! Append-only audit trail of mutation attempts.
//!
//! Frame format: `[length:4][seq:8][json:length][crc32:4]`, little endian.
//! A reader returns the longest run of intact frames from the start of the
//! file, so a frame torn by a crash (or still being written) is never seen.

pub mod entry;

pub use entry::{ChangeAction, ChangeEntry};

use crate::utils::ChangeLogError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// length(4) + seq(8)
const FRAME_HEADER: usize = 12;
const FRAME_TRAILER: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogStats {
    pub entries: u64,
    pub last_seq: u64,
}

struct Writer {
    file: File,
    len: u64,
    next_seq: u64,
    entries: u64,
}

/// Single shared log; every agent appends through the same writer lock.
pub struct ChangeLog {
    path: PathBuf,
    sync_every_append: bool,
    writer: Mutex<Writer>,
}

impl ChangeLog {
    /// Open for appending, cutting off any torn tail left by a crash.
    pub fn open(path: &Path, sync_every_append: bool) -> Result<Self, ChangeLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (entries, valid_len) = decode_frames(&bytes);

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = bytes.len() - valid_len,
                "Change log has an incomplete trailing record, truncating"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let last_seq = entries.last().map(|e| e.seq).unwrap_or(0);
        debug!(path = %path.display(), entries = entries.len(), last_seq, "Change log opened");

        Ok(Self {
            path: path.to_path_buf(),
            sync_every_append,
            writer: Mutex::new(Writer {
                file,
                len: valid_len as u64,
                next_seq: last_seq + 1,
                entries: entries.len() as u64,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, assigning its sequence number and timestamp.
    pub fn append(&self, mut entry: ChangeEntry) -> Result<ChangeEntry, ChangeLogError> {
        let mut writer = self.writer.lock();

        entry.seq = writer.next_seq;
        entry.timestamp = Utc::now();
        let frame = encode_frame(&entry)?;

        let written = writer.file.write_all(&frame).and_then(|()| {
            if self.sync_every_append {
                writer.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // Keep the file a clean sequence of frames for the next append
            let len = writer.len;
            if let Err(repair) = writer.file.set_len(len) {
                warn!(error = %repair, "Failed to cut partial change log record");
            }
            return Err(e.into());
        }

        writer.len += frame.len() as u64;
        writer.next_seq += 1;
        writer.entries += 1;
        Ok(entry)
    }

    /// Swap the writer for a read-only handle so every later append fails.
    #[cfg(test)]
    pub(crate) fn fail_appends(&self) -> io::Result<()> {
        self.writer.lock().file = File::open(&self.path)?;
        Ok(())
    }

    pub fn stats(&self) -> ChangeLogStats {
        let writer = self.writer.lock();
        ChangeLogStats {
            entries: writer.entries,
            last_seq: writer.next_seq - 1,
        }
    }

    /// Read the consistent prefix of this log
    pub fn entries(&self) -> Result<Vec<ChangeEntry>, ChangeLogError> {
        Self::read(&self.path)
    }

    /// Read any change log file without opening it for writing
    pub fn read(path: &Path) -> Result<Vec<ChangeEntry>, ChangeLogError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(decode_frames(&bytes).0)
    }
}

fn encode_frame(entry: &ChangeEntry) -> Result<Vec<u8>, ChangeLogError> {
    let payload = serde_json::to_vec(entry)?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len() + FRAME_TRAILER);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&entry.seq.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decode intact frames; returns them with the byte length they cover.
fn decode_frames(bytes: &[u8]) -> (Vec<ChangeEntry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= FRAME_HEADER {
        let header = &bytes[offset..offset + FRAME_HEADER];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&header[4..12]);
        let seq = u64::from_le_bytes(seq_bytes);

        let end = offset + FRAME_HEADER + length + FRAME_TRAILER;
        if length == 0 || end > bytes.len() {
            break;
        }

        let payload = &bytes[offset + FRAME_HEADER..end - FRAME_TRAILER];
        let trailer = &bytes[end - FRAME_TRAILER..end];
        let stored_crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(payload) != stored_crc {
            break;
        }

        match serde_json::from_slice::<ChangeEntry>(payload) {
            Ok(entry) if entry.seq == seq => entries.push(entry),
            _ => break,
        }
        offset = end;
    }

    (entries, offset)
}
