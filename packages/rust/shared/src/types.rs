//! Core domain types for scanned files and their derived records.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Source language, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Markdown,
    Config,
    Other,
}

impl Language {
    /// Detect the language of `path` from its extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("py" | "pyi") => Self::Python,
            Some("rs") => Self::Rust,
            Some("js" | "jsx" | "mjs" | "cjs") => Self::JavaScript,
            Some("ts" | "tsx" | "mts" | "cts") => Self::TypeScript,
            Some("go") => Self::Go,
            Some("java") => Self::Java,
            Some("md" | "mdx" | "rst") => Self::Markdown,
            Some("toml" | "yaml" | "yml" | "json" | "ini" | "cfg") => Self::Config,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Rust => "rust",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Markdown => "markdown",
            Self::Config => "config",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "python" => Self::Python,
            "rust" => Self::Rust,
            "javascript" => Self::JavaScript,
            "typescript" => Self::TypeScript,
            "go" => Self::Go,
            "java" => Self::Java,
            "markdown" => Self::Markdown,
            "config" => Self::Config,
            _ => Self::Other,
        }
    }

    /// Whether the language carries code elements worth parsing.
    pub fn is_code(&self) -> bool {
        !matches!(self, Self::Markdown | Self::Config | Self::Other)
    }
}

// ---------------------------------------------------------------------------
// DiscoveredFile
// ---------------------------------------------------------------------------

/// A file recorded by the scanner. Keyed by `path` (relative to the scan root,
/// `/`-separated); replaced on every rescan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredFile {
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    pub language: Language,
    /// Relevance score in `[0, 1]`.
    pub score: f64,
    /// SHA-256 of the content; `None` when the content was not read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Whether the file exceeded the configured size cap.
    #[serde(default)]
    pub oversized: bool,
    /// When the file was first recorded. Preserved across rescans by the store.
    pub discovered_at: DateTime<Utc>,
    pub last_analyzed: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CodeElement
// ---------------------------------------------------------------------------

/// Kind of structural element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Function,
    Class,
    Import,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

/// A function, class or import found in a file.
///
/// For imports, `name` is the imported module path as written in the source
/// (e.g. `pkg.sub`, `./util`, `crate::store`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeElement {
    pub kind: ElementKind,
    pub name: String,
    /// 1-based, inclusive.
    pub line_start: u32,
    pub line_end: u32,
    #[serde(default)]
    pub is_async: bool,
    /// Base classes / extended types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<String>,
    /// Decorators / attributes, without the leading `@`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decorators: Vec<String>,
    /// 1.0 for structural parses, lower for heuristic matches.
    pub confidence: f64,
}

impl CodeElement {
    /// Convenience constructor with empty qualifiers.
    pub fn new(kind: ElementKind, name: impl Into<String>, line: u32, confidence: f64) -> Self {
        Self {
            kind,
            name: name.into(),
            line_start: line,
            line_end: line,
            is_async: false,
            bases: Vec::new(),
            decorators: Vec::new(),
            confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// A dictionary hit: a keyword found at a line, tagged with its pattern type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_type: String,
    /// The matched text.
    pub value: String,
    /// 1-based line number.
    pub line: u32,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// ScanResult
// ---------------------------------------------------------------------------

/// Which parser produced a file's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Structural,
    Heuristic,
    /// No parse was attempted (oversized, non-code, unreadable).
    None,
}

/// Everything the scanner learned about one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub file: DiscoveredFile,
    pub elements: Vec<CodeElement>,
    pub patterns: Vec<Pattern>,
    pub parser: ParserKind,
}

impl ScanResult {
    /// Distinct pattern types, sorted.
    pub fn pattern_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .patterns
            .iter()
            .map(|p| p.pattern_type.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// The active classification of a file; overwritten on reclassification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub path: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    /// Importance in `[0, 10]`.
    pub importance: f64,
    pub tags: Vec<String>,
}

/// A scan result paired with its classification, as handed to the extractor.
#[derive(Debug, Clone)]
pub struct ClassifiedResult {
    pub scan: ScanResult,
    pub classification: Classification,
}
