//! Shared types, error model, and configuration for codelore.
//!
//! This crate is the foundation depended on by all other codelore crates.
//! It provides:
//! - [`LoreError`]: the unified error type
//! - Domain types ([`DiscoveredFile`], [`CodeElement`], [`Pattern`],
//!   [`Classification`], [`Concept`], [`Relationship`], [`PipelineRun`])
//! - Configuration ([`AppConfig`], [`ScanConfig`], config loading)

pub mod config;
pub mod error;
pub mod knowledge;
pub mod run;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifyConfig, EventsConfig, ExtractConfig, ScanConfig, ScanSection,
    StorageConfig, WatchConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from,
};
pub use error::{LoreError, Result};
pub use knowledge::{
    Concept, ConceptFilter, ConceptObservation, Evidence, ExtractionKind, ExtractionRecord,
    RelationKind, Relationship, RelationshipFilter, RelationshipObservation,
};
pub use run::{PipelineRun, RunCounts, RunId, RunStatus, Stage, Trigger};
pub use types::{
    Classification, ClassifiedResult, CodeElement, DiscoveredFile, ElementKind, Language,
    ParserKind, Pattern, ScanResult,
};
