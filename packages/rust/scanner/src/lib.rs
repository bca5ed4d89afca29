//! File-tree scanner: enumeration, parsing, pattern detection and scoring.
//!
//! [`Scanner::scan`] is a lazy, finite sequence of [`ScanResult`]s; calling it
//! again restarts the walk from scratch. The orchestrator drives the same
//! pieces ([`Scanner::walk`] + [`Scanner::scan_file`]) through a worker pool.

pub mod parser;
pub mod patterns;
pub mod score;
mod walk;

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use globset::GlobSet;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use codelore_shared::{
    DiscoveredFile, Language, LoreError, ParserKind, Result, ScanConfig, ScanResult,
};

pub use walk::{FileWalk, relative_path};

/// Scanner over a single root.
pub struct Scanner {
    config: ScanConfig,
    root: PathBuf,
    exclude: GlobSet,
}

impl Scanner {
    /// Create a scanner. The root must exist.
    pub fn new(config: ScanConfig) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .map_err(|e| LoreError::io(&config.root, e))?;
        let mut patterns = config.exclude.clone();
        if let Some(db) = &config.db_path {
            patterns.extend(store_excludes(&root, db));
        }
        let exclude = walk::build_exclude_set(&patterns)?;
        Ok(Self {
            config,
            root,
            exclude,
        })
    }

    /// Canonical scan root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Resolve an optional scope to an absolute path inside the root.
    ///
    /// Relative scopes are joined onto the root. The scope need not exist
    /// (a deleted file is a valid scope), but it may not escape the root.
    pub fn resolve_scope(&self, scope: Option<&Path>) -> Result<PathBuf> {
        let Some(scope) = scope else {
            return Ok(self.root.clone());
        };

        let joined = if scope.is_absolute() {
            scope.to_path_buf()
        } else {
            if scope.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(LoreError::validation(format!(
                    "scope '{}' must not contain '..'",
                    scope.display()
                )));
            }
            self.root.join(scope)
        };

        let resolved = joined.canonicalize().unwrap_or(joined);
        if !resolved.starts_with(&self.root) {
            return Err(LoreError::validation(format!(
                "scope '{}' is outside the scan root '{}'",
                scope.display(),
                self.root.display()
            )));
        }
        Ok(resolved)
    }

    /// Root-relative, `/`-separated key for `path`.
    pub fn relative_path(&self, path: &Path) -> String {
        relative_path(&self.root, path)
    }

    /// Whether `path` (absolute, or relative to the root) falls under an
    /// exclude glob.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let rel = if path.is_absolute() {
            self.relative_path(path)
        } else {
            path.to_string_lossy().replace('\\', "/")
        };
        self.exclude.is_match(&rel)
    }

    /// Enumerate candidate files under `scope` (an absolute path from
    /// [`Scanner::resolve_scope`]).
    pub fn walk(&self, scope: &Path) -> FileWalk {
        FileWalk::new(&self.root, scope, self.exclude.clone(), &self.config.extensions)
    }

    /// Lazily scan every file under `scope`. Files that cannot be read are
    /// logged and left out; they never end the sequence.
    pub fn scan(&self, scope: Option<&Path>) -> Result<impl Iterator<Item = ScanResult> + '_> {
        let scope = self.resolve_scope(scope)?;
        Ok(self.walk(&scope).filter_map(move |path| match self.scan_file(&path) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to scan file, skipping");
                None
            }
        }))
    }

    /// Scan a single file.
    ///
    /// Files over the size cap are recorded with score 0 and no elements or
    /// patterns, without reading their content. Non-UTF-8 content is
    /// recorded the same way (with its hash).
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn scan_file(&self, path: &Path) -> Result<ScanResult> {
        let metadata = std::fs::symlink_metadata(path).map_err(|e| LoreError::io(path, e))?;
        let rel = self.relative_path(path);
        let language = Language::from_path(path);
        let now = Utc::now();

        let mut file = DiscoveredFile {
            path: rel,
            size: metadata.len(),
            language,
            score: 0.0,
            content_hash: None,
            oversized: false,
            discovered_at: now,
            last_analyzed: now,
        };

        if metadata.len() > self.config.max_file_size {
            debug!(size = metadata.len(), cap = self.config.max_file_size, "oversized file recorded without content");
            file.oversized = true;
            return Ok(empty_result(file));
        }

        let bytes = std::fs::read(path).map_err(|e| LoreError::io(path, e))?;
        file.content_hash = Some(content_hash(&bytes));

        let Ok(source) = std::str::from_utf8(&bytes) else {
            debug!("non-UTF-8 content, recording without analysis");
            return Ok(empty_result(file));
        };

        let (elements, parser) = if language.is_code() {
            parser::parse_elements(language, source)
        } else {
            (Vec::new(), ParserKind::None)
        };
        let patterns = patterns::detect_patterns(source, self.config.max_patterns_per_file);

        let mut result = ScanResult {
            file,
            elements,
            patterns,
            parser,
        };
        result.file.score = score::relevance_score(
            result.pattern_types().len(),
            result.patterns.len(),
            result.elements.len(),
        );
        Ok(result)
    }
}

fn empty_result(file: DiscoveredFile) -> ScanResult {
    ScanResult {
        file,
        elements: Vec::new(),
        patterns: Vec::new(),
        parser: ParserKind::None,
    }
}

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Globs for the database at `db` and its `-wal`/`-shm`/`-journal`
/// siblings, when it sits under `root`.
fn store_excludes(root: &Path, db: &Path) -> Vec<String> {
    let (Some(dir), Some(name)) = (db.parent(), db.file_name()) else {
        return Vec::new();
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let Ok(dir) = dir.canonicalize() else {
        return Vec::new();
    };
    let db = dir.join(name);
    if !db.starts_with(root) {
        return Vec::new();
    }
    let rel = globset::escape(&relative_path(root, &db));
    vec![rel.clone(), format!("{rel}-*")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelore_shared::ElementKind;

    fn scanner(root: &Path) -> Scanner {
        let config = ScanConfig {
            root: root.to_path_buf(),
            max_file_size: 256,
            ..ScanConfig::default()
        };
        Scanner::new(config).expect("scanner")
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    const ASYNC_SRC: &str = "import asyncio\n\nasync def fetch(url):\n    await asyncio.sleep(1)\n    return url\n";

    #[test]
    fn async_python_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "svc/fetch.py", ASYNC_SRC);
        let s = scanner(dir.path());

        let results: Vec<_> = s.scan(None).unwrap().collect();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.file.path, "svc/fetch.py");
        assert_eq!(r.parser, ParserKind::Structural);

        let functions: Vec<_> = r
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Function)
            .collect();
        assert_eq!(functions.len(), 1);
        assert!(functions[0].is_async);
        assert!(r.patterns.iter().any(|p| p.pattern_type == "async" && p.line == 3));
        assert!(r.file.score > 0.0);
    }

    #[test]
    fn rescanning_unmodified_file_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", ASYNC_SRC);
        let s = scanner(dir.path());
        let path = dir.path().join("a.py");

        let first = s.scan_file(&path).unwrap();
        let second = s.scan_file(&path).unwrap();
        assert_eq!(first.file.score, second.file.score);
        assert_eq!(first.file.content_hash, second.file.content_hash);
        assert_eq!(first.patterns, second.patterns);
    }

    #[test]
    fn oversized_file_is_recorded_with_zero_score() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.py", &"async def f():\n    await g()\n".repeat(50));
        let s = scanner(dir.path());

        let results: Vec<_> = s.scan(None).unwrap().collect();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert!(r.file.oversized);
        assert_eq!(r.file.score, 0.0);
        assert!(r.elements.is_empty());
        assert!(r.patterns.is_empty());
        assert!(r.file.content_hash.is_none());
    }

    #[test]
    fn empty_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = scanner(dir.path());
        assert_eq!(s.scan(None).unwrap().count(), 0);
    }

    #[test]
    fn scan_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        write(dir.path(), "b.py", "y = 2\n");
        let s = scanner(dir.path());
        assert_eq!(s.scan(None).unwrap().count(), 2);
        assert_eq!(s.scan(None).unwrap().count(), 2);
    }

    #[test]
    fn non_utf8_file_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.py"), [0xff, 0xfe, 0x00, 0x41]).unwrap();
        let s = scanner(dir.path());
        let r = s.scan_file(&dir.path().join("blob.py")).unwrap();
        assert_eq!(r.file.score, 0.0);
        assert!(r.file.content_hash.is_some());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = scanner(dir.path());
        let err = s.scan_file(&dir.path().join("gone.py")).unwrap_err();
        assert!(matches!(err, LoreError::Io { .. }));
    }

    #[test]
    fn scope_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/a.py", "x = 1\n");
        write(dir.path(), "other/b.py", "y = 1\n");
        let s = scanner(dir.path());

        let scoped: Vec<_> = s
            .scan(Some(Path::new("pkg")))
            .unwrap()
            .map(|r| r.file.path)
            .collect();
        assert_eq!(scoped, vec!["pkg/a.py"]);

        assert!(s.resolve_scope(Some(Path::new("../etc"))).is_err());
        assert!(s.resolve_scope(Some(Path::new("/definitely/elsewhere"))).is_err());
        // Deleted paths still resolve so runs can clean them up.
        let gone = s.resolve_scope(Some(Path::new("pkg/gone.py"))).unwrap();
        assert!(gone.ends_with("pkg/gone.py"));
    }

    #[test]
    fn exclusion_matches_relative_and_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let s = scanner(dir.path());
        assert!(s.is_excluded(Path::new("node_modules/x/index.js")));
        assert!(s.is_excluded(&s.root().join(".git/HEAD")));
        assert!(!s.is_excluded(&s.root().join("pkg/a.py")));
    }

    #[test]
    fn store_files_are_never_scanned() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "state/lore.db", "not source");
        write(dir.path(), "state/lore.db-wal", "not source");
        write(dir.path(), "state/notes.txt", "kept");
        let config = ScanConfig {
            root: dir.path().to_path_buf(),
            exclude: Vec::new(),
            extensions: Vec::new(),
            db_path: Some(dir.path().join("state/lore.db")),
            ..ScanConfig::default()
        };
        let s = Scanner::new(config).unwrap();

        let paths: Vec<_> = s.scan(None).unwrap().map(|r| r.file.path).collect();
        assert_eq!(paths, vec!["state/notes.txt"]);
        assert!(s.is_excluded(Path::new("state/lore.db-shm")));
    }
}
