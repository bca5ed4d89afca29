//! Lazy, restartable file enumeration under a scope.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use codelore_shared::{LoreError, Result};

/// Build a glob set from exclude patterns.
pub(crate) fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| LoreError::config(format!("invalid exclude glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| LoreError::config(format!("failed to build exclude set: {e}")))
}

/// Path of `path` relative to `root`, `/`-separated.
pub fn relative_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}

/// Iterator over scannable files below a scope.
///
/// Symlinks are never followed or yielded. Excluded directories are pruned
/// without descending into them. Walk errors are logged and skipped.
pub struct FileWalk {
    inner: walkdir::IntoIter,
    root: PathBuf,
    exclude: GlobSet,
    extensions: Vec<String>,
}

impl FileWalk {
    pub(crate) fn new(root: &Path, scope: &Path, exclude: GlobSet, extensions: &[String]) -> Self {
        Self {
            inner: WalkDir::new(scope)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
            root: root.to_path_buf(),
            exclude,
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.exclude.is_match(rel)
    }

    /// A directory is pruned when anything inside it would be excluded.
    fn is_excluded_dir(&self, rel: &str) -> bool {
        !rel.is_empty() && (self.is_excluded(rel) || self.is_excluded(&format!("{rel}/_")))
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

impl Iterator for FileWalk {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "walk error, skipping entry");
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }

            let rel = relative_path(&self.root, entry.path());

            if file_type.is_dir() {
                if entry.depth() > 0 && self.is_excluded_dir(&rel) {
                    debug!(path = %rel, "pruning excluded directory");
                    self.inner.skip_current_dir();
                }
                continue;
            }

            if !file_type.is_file() || self.is_excluded(&rel) || !self.extension_allowed(entry.path())
            {
                continue;
            }

            return Some(entry.into_path());
        }
    }
}
