//! Workspace traversal for agents.
//!
//! Agents observe the workspace through this walker: regular files only,
//! filtered by extension, excluded directory names and a size cap.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Directory or file names skipped entirely
    pub exclude_names: Vec<String>,

    /// Only keep files with one of these extensions (empty = keep all)
    pub extensions: Vec<String>,

    /// Skip files larger than this many bytes
    pub max_file_size: u64,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_names: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
            ],
            extensions: Vec::new(),
            max_file_size: 4 * 1024 * 1024,
        }
    }
}

impl WalkOptions {
    pub fn with_extensions(mut self, extensions: &[String]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

/// Walk a directory tree and collect matching regular files, sorted by path
///
/// # Example
/// ```no_run
/// use warden_agent::fs::walker::{walk_files, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_files(Path::new("/srv/ws"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut files = Vec::new();
    let iter = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options.exclude_names));

    for entry in iter {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !has_wanted_extension(entry.path(), &options.extensions) {
            continue;
        }

        let size = entry.metadata()?.len();
        if size > options.max_file_size {
            continue;
        }

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        files.push(FileInfo {
            path,
            relative_path,
            size,
        });
    }

    Ok(files)
}

fn is_excluded(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}

fn has_wanted_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            extensions.iter().any(|e| *e == ext)
        })
        .unwrap_or(false)
}
