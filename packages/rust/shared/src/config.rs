//! Application configuration for codelore.
//!
//! User config lives at `~/.codelore/codelore.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoreError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "codelore.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".codelore";

// ---------------------------------------------------------------------------
// Config structs (matching codelore.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scan: ScanSection,

    #[serde(default)]
    pub classify: ClassifyConfig,

    #[serde(default)]
    pub extract: ExtractConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[scan]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSection {
    /// Root of the scanned tree.
    #[serde(default = "default_root")]
    pub root: String,

    /// Glob patterns excluded from scanning, matched against root-relative paths.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// File extensions to scan (without the dot). Empty means all files.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Files larger than this are recorded with score 0 and not read.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Per-file parse timeout.
    #[serde(default = "default_parse_timeout_ms")]
    pub parse_timeout_ms: u64,

    /// Worker pool size for per-file work.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Files per batch; cancellation is checked between batches.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on dictionary hits recorded per file.
    #[serde(default = "default_max_patterns")]
    pub max_patterns_per_file: usize,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            exclude: default_exclude(),
            extensions: Vec::new(),
            max_file_size: default_max_file_size(),
            parse_timeout_ms: default_parse_timeout_ms(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_patterns_per_file: default_max_patterns(),
        }
    }
}

fn default_root() -> String {
    ".".into()
}
fn default_exclude() -> Vec<String> {
    [
        "**/.git/**",
        "**/target/**",
        "**/node_modules/**",
        "**/__pycache__/**",
        "**/.venv/**",
        "**/.codelore/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_parse_timeout_ms() -> u64 {
    2000
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    32
}
fn default_max_patterns() -> usize {
    200
}

/// `[classify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Maximum number of tags per file.
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Importance floor for files that match no rule.
    #[serde(default = "default_baseline_importance")]
    pub baseline_importance: f64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            max_tags: default_max_tags(),
            baseline_importance: default_baseline_importance(),
        }
    }
}

fn default_max_tags() -> usize {
    5
}
fn default_baseline_importance() -> f64 {
    1.0
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Minimum importance for a file to enter extraction.
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            importance_threshold: default_importance_threshold(),
        }
    }
}

fn default_importance_threshold() -> f64 {
    3.0
}

/// `[watch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Extensions whose changes trigger re-runs.
    #[serde(default = "default_watch_extensions")]
    pub extensions: Vec<String>,

    /// Minimum time between accepted triggers for the same path.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// First restart delay after a watcher error.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Restart delay ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: default_watch_extensions(),
            debounce_ms: default_debounce_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_watch_extensions() -> Vec<String> {
    ["py", "rs", "ts", "tsx", "js", "jsx", "go", "java", "md", "toml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_debounce_ms() -> u64 {
    5000
}
fn default_backoff_initial_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

/// `[events]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it is disconnected.
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: default_event_buffer(),
        }
    }
}

fn default_event_buffer() -> usize {
    1024
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Relative paths resolve against the scan root;
    /// unset means `<root>/.codelore/codelore.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Scan config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scan configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub root: PathBuf,
    pub exclude: Vec<String>,
    pub extensions: Vec<String>,
    pub max_file_size: u64,
    pub parse_timeout: Duration,
    pub workers: usize,
    pub batch_size: usize,
    pub max_patterns_per_file: usize,
    /// The knowledge store's own file. Always skipped when it lies under
    /// the root, whatever `exclude` says.
    pub db_path: Option<PathBuf>,
}

impl From<&AppConfig> for ScanConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            root: PathBuf::from(&config.scan.root),
            exclude: config.scan.exclude.clone(),
            extensions: config.scan.extensions.clone(),
            max_file_size: config.scan.max_file_size,
            parse_timeout: Duration::from_millis(config.scan.parse_timeout_ms),
            workers: config.scan.workers.max(1),
            batch_size: config.scan.batch_size.max(1),
            max_patterns_per_file: config.scan.max_patterns_per_file,
            db_path: Some(config.db_path()),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl AppConfig {
    /// Resolve the database path against the scan root.
    pub fn db_path(&self) -> PathBuf {
        let root = PathBuf::from(&self.scan.root);
        match &self.storage.db_path {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => root.join(p),
            None => root.join(CONFIG_DIR_NAME).join("codelore.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.codelore/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| LoreError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.codelore/codelore.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LoreError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LoreError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LoreError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| LoreError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LoreError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_file_size"));
        assert!(toml_str.contains("debounce_ms"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.scan.max_file_size, 1024 * 1024);
        assert_eq!(parsed.watch.debounce_ms, 5000);
        assert_eq!(parsed.extract.importance_threshold, 3.0);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[scan]
root = "/srv/repo"
max_file_size = 4096

[watch]
debounce_ms = 250
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.scan.root, "/srv/repo");
        assert_eq!(config.scan.workers, 4);
        assert_eq!(config.watch.debounce(), Duration::from_millis(250));
        assert_eq!(config.classify.max_tags, 5);
        assert_eq!(
            config.db_path(),
            PathBuf::from("/srv/repo/.codelore/codelore.db")
        );
    }

    #[test]
    fn scan_config_from_app_config() {
        let mut app = AppConfig::default();
        app.scan.workers = 0;
        let scan = ScanConfig::from(&app);
        assert_eq!(scan.workers, 1);
        assert_eq!(scan.batch_size, 32);
        assert_eq!(scan.parse_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn db_path_resolution() {
        let mut app = AppConfig::default();
        app.scan.root = "/work".into();
        app.storage.db_path = Some("state/lore.db".into());
        assert_eq!(app.db_path(), PathBuf::from("/work/state/lore.db"));
        app.storage.db_path = Some("/var/lore.db".into());
        assert_eq!(app.db_path(), PathBuf::from("/var/lore.db"));
    }
}
