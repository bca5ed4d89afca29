//! Error types for codelore.
//!
//! Library crates use [`LoreError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::run::{RunId, Stage};

/// Top-level error type for all codelore operations.
#[derive(Debug, thiserror::Error)]
pub enum LoreError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Source parsing error (structural parser rejected the file).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad scope, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline run is already active.
    #[error("a pipeline run is already active ({run_id})")]
    AlreadyRunning { run_id: RunId },

    /// A pipeline stage failed; the remaining stages of the run were skipped.
    #[error("stage {stage} failed: {message}")]
    StageFailed { stage: Stage, message: String },

    /// Filesystem watcher error (transient; the watcher restarts).
    #[error("watcher error: {0}")]
    Watcher(String),

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LoreError>;

impl LoreError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any error raised inside a stage.
    pub fn stage(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::StageFailed {
            stage,
            message: err.to_string(),
        }
    }
}
