//! Pipeline run bookkeeping types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Watch,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Watch => "watch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "watch" => Some(Self::Watch),
            _ => None,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scanning,
    Classifying,
    Extracting,
    Persisting,
}

impl Stage {
    /// All stages in the order a run executes them.
    pub const ALL: [Stage; 4] = [
        Stage::Scanning,
        Stage::Classifying,
        Stage::Extracting,
        Stage::Persisting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Classifying => "classifying",
            Self::Extracting => "extracting",
            Self::Persisting => "persisting",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a [`PipelineRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the run has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// Per-run counters, reported in status snapshots and `run_completed` summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Files discovered under the scope.
    pub files_total: usize,
    /// Files scanned (including oversized files recorded with score 0).
    pub files_scanned: usize,
    /// Files over the size cap.
    pub files_oversized: usize,
    /// Files skipped because of read errors or parse timeouts.
    pub files_skipped: usize,
    /// Files removed from the store because they no longer exist.
    pub files_removed: usize,
    pub elements: usize,
    pub patterns: usize,
    pub classified: usize,
    /// Files at or above the importance threshold.
    pub extracted_files: usize,
    pub extraction_records: usize,
    pub concepts: usize,
    pub relationships: usize,
}

/// One end-to-end execution of scan → classify → extract → persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub trigger: Trigger,
    /// Scope relative to the scan root; `None` means a full-root run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage name → wall-clock duration in milliseconds.
    #[serde(default)]
    pub stage_durations: BTreeMap<String, u64>,
    #[serde(default)]
    pub counts: RunCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    /// Create a new run in the `running` state.
    pub fn start(trigger: Trigger, scope: Option<String>) -> Self {
        Self {
            run_id: RunId::new(),
            trigger,
            scope,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stage_durations: BTreeMap::new(),
            counts: RunCounts::default(),
            error: None,
        }
    }

    /// Mark the run terminal with the given status.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn stage_order_is_pipeline_order() {
        let mut stages = Stage::ALL.to_vec();
        stages.sort();
        assert_eq!(stages, Stage::ALL.to_vec());
        assert_eq!(Stage::Persisting.to_string(), "persisting");
    }

    #[test]
    fn finish_sets_terminal_state() {
        let mut run = PipelineRun::start(Trigger::Manual, None);
        assert!(!run.status.is_terminal());
        run.finish(RunStatus::Failed, Some("disk full".into()));
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
        assert_eq!(run.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Trigger::parse("watch"), Some(Trigger::Watch));
        assert_eq!(Trigger::parse("cron"), None);
    }
}
