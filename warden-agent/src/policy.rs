//! Safe-directory policy: decides whether an agent may touch a path.
//!
//! A path is mutable iff, after `..` and symlink resolution, it is a strict
//! descendant of an allowed root, lies outside every protected directory and
//! matches none of the deny patterns.
//! Evaluation fails closed: anything that cannot be resolved is not mutable.

use crate::config::PolicyConfig;
use crate::utils::PolicyError;
use glob::{MatchOptions, Pattern};
use std::io;
use std::path::{Component, Path, PathBuf};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Outcome of evaluating a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Mutable(PathBuf),
    OutsideRoots(PathBuf),
    Denied { resolved: PathBuf, pattern: String },
    Protected { resolved: PathBuf, protected: PathBuf },
    Unresolvable(String),
}

impl Verdict {
    pub fn is_mutable(&self) -> bool {
        matches!(self, Verdict::Mutable(_))
    }

    /// Human-readable reason for a refusal, recorded in the change log.
    pub fn reason(&self) -> String {
        match self {
            Verdict::Mutable(_) => "mutable".to_string(),
            Verdict::OutsideRoots(resolved) => {
                format!("outside safe scope (resolves to {})", resolved.display())
            }
            Verdict::Denied { pattern, .. } => {
                format!("outside safe scope (denied by pattern {pattern})")
            }
            Verdict::Protected { protected, .. } => format!(
                "outside safe scope (inside supervisor data directory {})",
                protected.display()
            ),
            Verdict::Unresolvable(err) => format!("outside safe scope (unresolvable: {err})"),
        }
    }
}

/// Immutable allow/deny evaluator, loaded once per supervisor run.
#[derive(Debug)]
pub struct SafeDirectoryPolicy {
    allowed_roots: Vec<PathBuf>,
    denied_patterns: Vec<Pattern>,
    protected: Vec<PathBuf>,
}

impl SafeDirectoryPolicy {
    /// Load a policy. Roots must exist so they can be canonicalized.
    pub fn load(roots: &[PathBuf], denied: &[String]) -> Result<Self, PolicyError> {
        let mut allowed_roots = Vec::with_capacity(roots.len());
        for root in roots {
            if !root.is_absolute() {
                return Err(PolicyError::RelativeRoot(root.clone()));
            }
            let canonical =
                std::fs::canonicalize(root).map_err(|source| PolicyError::RootUnavailable {
                    root: root.clone(),
                    source,
                })?;
            if !allowed_roots.contains(&canonical) {
                allowed_roots.push(canonical);
            }
        }

        let denied_patterns = denied
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| PolicyError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_roots,
            denied_patterns,
            protected: Vec::new(),
        })
    }

    /// Load the configured policy with the supervisor's data directory
    /// protected. The data directory must already exist.
    pub fn from_config(config: &PolicyConfig, data_dir: &Path) -> Result<Self, PolicyError> {
        Self::load(&config.safe_directories, &config.denied_patterns)?.protect(data_dir)
    }

    /// Refuse every path under `dir`, even inside an allowed root.
    pub fn protect(mut self, dir: &Path) -> Result<Self, PolicyError> {
        let canonical =
            std::fs::canonicalize(dir).map_err(|source| PolicyError::ProtectedUnavailable {
                dir: dir.to_path_buf(),
                source,
            })?;
        if !self.protected.contains(&canonical) {
            self.protected.push(canonical);
        }
        Ok(self)
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    pub fn is_mutable(&self, path: &Path) -> bool {
        self.evaluate(path).is_mutable()
    }

    pub fn evaluate(&self, path: &Path) -> Verdict {
        let resolved = match resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => return Verdict::Unresolvable(e.to_string()),
        };

        let Some(root) = self
            .allowed_roots
            .iter()
            .find(|root| resolved != **root && resolved.starts_with(root))
        else {
            return Verdict::OutsideRoots(resolved);
        };

        if let Some(protected) = self.protected.iter().find(|p| resolved.starts_with(p)) {
            return Verdict::Protected {
                protected: protected.clone(),
                resolved,
            };
        }

        let relative = resolved.strip_prefix(root).unwrap_or(&resolved);
        if let Some(pattern) = self.denied_patterns.iter().find(|p| {
            p.matches_path_with(&resolved, MATCH_OPTIONS)
                || p.matches_path_with(relative, MATCH_OPTIONS)
        }) {
            return Verdict::Denied {
                pattern: pattern.as_str().to_string(),
                resolved,
            };
        }

        Verdict::Mutable(resolved)
    }
}

/// Resolve `path` to an absolute, symlink-free form.
///
/// A path that does not exist yet resolves through its parent so agents can
/// create files. A dangling symlink is an error.
pub fn resolve(path: &Path) -> io::Result<PathBuf> {
    if !path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "relative paths are not accepted",
        ));
    }

    match std::fs::symlink_metadata(path) {
        Ok(_) => std::fs::canonicalize(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let name = match path.components().next_back() {
                Some(Component::Normal(name)) => name.to_owned(),
                _ => return Err(e),
            };
            let parent = path.parent().ok_or(e)?;
            Ok(std::fs::canonicalize(parent)?.join(name))
        }
        Err(e) => Err(e),
    }
}
