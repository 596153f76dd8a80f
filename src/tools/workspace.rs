//! Trusted workspace boundary for path arguments.
//!
//! Paths are resolved against the workspace root and checked for containment
//! after lexical normalization. When the path (or its nearest existing
//! ancestor) exists on disk it is canonicalized as well, so a symlink inside
//! the root that points elsewhere is treated as outside.

use std::path::{Component, Path, PathBuf};

/// Directory boundary beyond which file operations require approval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedWorkspace {
    root: Option<PathBuf>,
}

impl TrustedWorkspace {
    /// Trust everything beneath `root`. Canonicalizes the root once, so build
    /// it at setup rather than per call.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = expand_tilde(root.as_ref());
        let root = std::fs::canonicalize(&root).unwrap_or_else(|_| normalize_lexically(&root));
        Self { root: Some(root) }
    }

    /// A workspace with no trusted root: every path is outside.
    pub fn untrusted() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Directory used as the working directory for commands and relative paths.
    pub fn working_dir(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Resolve a raw path argument to an absolute, lexically normalized path.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let expanded = expand_tilde(Path::new(raw));
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.working_dir().join(expanded)
        };
        normalize_lexically(&joined)
    }

    /// Whether `raw` resolves to a location inside the trusted root.
    ///
    /// Blocking: canonicalizes the nearest existing ancestor.
    pub fn contains(&self, raw: &str) -> bool {
        let Some(root) = &self.root else {
            return false;
        };
        let resolved = self.resolve(raw);
        if !resolved.starts_with(root) {
            return false;
        }
        canonicalize_existing(&resolved).starts_with(root)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-attach the rest.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}
