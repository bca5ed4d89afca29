//! Knowledge-graph types: concepts, relationships, and extraction records.
//!
//! Concepts and relationships are only ever merged, never overwritten. The
//! derived numbers (`Concept::importance`, `Relationship::strength`) are pure
//! functions of accumulated state so that any store can recompute them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Extraction records
// ---------------------------------------------------------------------------

/// Typed extraction produced from structural signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    AgentClass,
    AsyncFunction,
    ToolFunction,
    McpIntegration,
    LlmCall,
    WorkflowDefinition,
}

impl ExtractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentClass => "agent_class",
            Self::AsyncFunction => "async_function",
            Self::ToolFunction => "tool_function",
            Self::McpIntegration => "mcp_integration",
            Self::LlmCall => "llm_call",
            Self::WorkflowDefinition => "workflow_definition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_class" => Some(Self::AgentClass),
            "async_function" => Some(Self::AsyncFunction),
            "tool_function" => Some(Self::ToolFunction),
            "mcp_integration" => Some(Self::McpIntegration),
            "llm_call" => Some(Self::LlmCall),
            "workflow_definition" => Some(Self::WorkflowDefinition),
            _ => None,
        }
    }
}

/// One extraction, with file/line provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub kind: ExtractionKind,
    pub file: String,
    pub line: u32,
    /// Element name or matched value.
    pub name: String,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Concepts
// ---------------------------------------------------------------------------

/// A named knowledge-graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub category: String,
    /// Importance in `[0, 10]`, recomputed on every upsert.
    pub importance: f64,
    /// Highest per-occurrence importance ever observed.
    pub peak_importance: f64,
    pub occurrence_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Concept {
    /// Importance as a function of the peak observed importance and the
    /// number of occurrences. Non-decreasing in both arguments.
    pub fn importance_from(peak_importance: f64, occurrence_count: u64) -> f64 {
        let recurrence = 1.0 - (-(occurrence_count as f64) / 10.0).exp();
        (peak_importance.clamp(0.0, 10.0) * 0.7 + 3.0 * recurrence).min(10.0)
    }
}

/// Per-run references to a concept, aggregated by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptObservation {
    pub name: String,
    pub category: String,
    /// Highest importance among the referencing files.
    pub importance: f64,
    /// Number of references in this run.
    pub occurrences: u64,
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// Typed edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    DependsOn,
    RelatedTo,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependsOn => "depends_on",
            Self::RelatedTo => "related_to",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "depends_on" => Some(Self::DependsOn),
            "related_to" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

/// Where a relationship was observed. Deduplicated by `(file, line)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Evidence {
    pub file: String,
    pub line: u32,
}

/// A weighted, typed edge between two concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    /// Strength in `[0, 1)`, recomputed from `evidence` on every upsert.
    pub strength: f64,
    /// Sorted, deduplicated evidence.
    pub evidence: Vec<Evidence>,
}

impl Relationship {
    /// Strength as a pure function of the accumulated evidence.
    ///
    /// Evidence from distinct files counts fully; repeated evidence within an
    /// already-seen file counts a quarter.
    pub fn strength_from(evidence: &[Evidence]) -> f64 {
        if evidence.is_empty() {
            return 0.0;
        }
        let distinct_files = evidence
            .iter()
            .map(|e| e.file.as_str())
            .collect::<BTreeSet<_>>()
            .len() as f64;
        let repeats = evidence.len() as f64 - distinct_files;
        let weight = distinct_files + 0.25 * repeats;
        1.0 - (-weight / 3.0).exp()
    }

    /// Merge `new` into `existing`, deduplicating by `(file, line)`.
    /// Returns the merged, sorted set.
    pub fn merge_evidence(existing: &[Evidence], new: &[Evidence]) -> Vec<Evidence> {
        existing
            .iter()
            .chain(new.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Per-run evidence for an edge, produced by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipObservation {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    pub evidence: Vec<Evidence>,
}

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

/// Filter for concept queries. Empty filter returns everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Filter for relationship queries. `concept` matches either endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RelationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(file: &str, line: u32) -> Evidence {
        Evidence {
            file: file.into(),
            line,
        }
    }

    #[test]
    fn strength_is_deterministic_and_bounded() {
        let evidence = vec![ev("a.py", 1), ev("b.py", 4), ev("b.py", 9)];
        let s1 = Relationship::strength_from(&evidence);
        let s2 = Relationship::strength_from(&evidence);
        assert_eq!(s1, s2);
        assert!(s1 > 0.0 && s1 < 1.0);
        assert_eq!(Relationship::strength_from(&[]), 0.0);
    }

    #[test]
    fn distinct_files_weigh_more_than_repeats() {
        let spread = vec![ev("a.py", 1), ev("b.py", 1)];
        let repeated = vec![ev("a.py", 1), ev("a.py", 2)];
        assert!(Relationship::strength_from(&spread) > Relationship::strength_from(&repeated));
    }

    #[test]
    fn merge_dedupes_by_file_and_line() {
        let merged = Relationship::merge_evidence(
            &[ev("a.py", 1), ev("b.py", 2)],
            &[ev("b.py", 2), ev("c.py", 3)],
        );
        assert_eq!(merged, vec![ev("a.py", 1), ev("b.py", 2), ev("c.py", 3)]);
    }

    #[test]
    fn concept_importance_is_monotonic() {
        let low = Concept::importance_from(5.0, 1);
        let high = Concept::importance_from(5.0, 20);
        assert!(high >= low);
        assert!(Concept::importance_from(10.0, 10_000) <= 10.0);
    }

    #[test]
    fn kind_strings_roundtrip() {
        for kind in [
            ExtractionKind::AgentClass,
            ExtractionKind::AsyncFunction,
            ExtractionKind::ToolFunction,
            ExtractionKind::McpIntegration,
            ExtractionKind::LlmCall,
            ExtractionKind::WorkflowDefinition,
        ] {
            assert_eq!(ExtractionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RelationKind::parse("depends_on"), Some(RelationKind::DependsOn));
    }
}
