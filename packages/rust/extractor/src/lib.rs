//! Knowledge extraction from classified scan results.
//!
//! Files at or above the importance threshold produce:
//! - typed [`ExtractionRecord`]s from structural signatures
//! - concept observations (`module:`, `pattern:` and `kind:` concepts)
//! - `depends_on` edges for imports of other known files, and `related_to`
//!   edges between pattern types that co-occur in a file
//!
//! Output is per run. Merging into accumulated knowledge, including the
//! strength recomputation, happens in the store.

pub mod index;
pub mod signatures;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use codelore_shared::{
    ClassifiedResult, ConceptObservation, ElementKind, Evidence, ExtractionKind, ExtractionRecord,
    RelationKind, RelationshipObservation,
};

pub use index::ModuleIndex;
pub use signatures::match_signatures;

/// Category of `pattern:` concepts.
pub const PATTERN_CATEGORY: &str = "pattern";
/// Category of `kind:` concepts.
pub const EXTRACTION_CATEGORY: &str = "extraction";
/// Category of `module:` concepts for files that were not classified this run.
pub const MODULE_CATEGORY: &str = "module";

/// Concept owning the file at `path`: `module:<path without extension>`.
pub fn module_concept(path: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    match dir {
        Some(dir) => format!("module:{dir}/{stem}"),
        None => format!("module:{stem}"),
    }
}

pub fn pattern_concept(pattern_type: &str) -> String {
    format!("pattern:{pattern_type}")
}

pub fn kind_concept(kind: ExtractionKind) -> String {
    format!("kind:{}", kind.as_str())
}

/// Result of one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Files that met the threshold.
    pub files_processed: usize,
    pub records: Vec<ExtractionRecord>,
    pub concepts: Vec<ConceptObservation>,
    pub relationships: Vec<RelationshipObservation>,
}

/// Turns classified results into knowledge observations.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    known_files: ModuleIndex,
}

impl Extractor {
    /// `known_files` lets imports resolve to files outside the current batch
    /// (e.g. everything discovered by earlier runs).
    pub fn new(known_files: ModuleIndex) -> Self {
        Self { known_files }
    }

    #[instrument(skip_all, fields(files = results.len(), threshold = threshold))]
    pub fn extract(&self, results: &[ClassifiedResult], threshold: f64) -> Extraction {
        let mut index = self.known_files.clone();
        let mut categories: BTreeMap<&str, &str> = BTreeMap::new();
        for r in results {
            index.insert(r.scan.file.path.clone());
            categories.insert(&r.scan.file.path, &r.classification.category);
        }

        let mut out = Extraction::default();
        let mut concepts = ConceptAccumulator::default();
        let mut edges: BTreeMap<(String, String, RelationKind), BTreeSet<Evidence>> = BTreeMap::new();

        for r in results.iter().filter(|r| r.classification.importance >= threshold) {
            out.files_processed += 1;
            let path = r.scan.file.path.as_str();
            let importance = r.classification.importance;
            let owner = module_concept(path);
            concepts.observe(&owner, &r.classification.category, importance, 1);

            // --- Typed records ---
            let records = match_signatures(&r.scan);
            let mut per_kind: BTreeMap<ExtractionKind, u64> = BTreeMap::new();
            for rec in &records {
                *per_kind.entry(rec.kind).or_default() += 1;
            }
            for (kind, n) in per_kind {
                concepts.observe(&kind_concept(kind), EXTRACTION_CATEGORY, importance, n);
            }
            out.records.extend(records);

            // --- Pattern concepts and co-occurrence ---
            let mut first_line: BTreeMap<&str, u32> = BTreeMap::new();
            for p in &r.scan.patterns {
                first_line.entry(p.pattern_type.as_str()).or_insert(p.line);
            }
            let types: Vec<(&str, u32)> = first_line.into_iter().collect();
            for (t, _) in &types {
                concepts.observe(&pattern_concept(t), PATTERN_CATEGORY, importance, 1);
            }
            for (i, (a, line_a)) in types.iter().enumerate() {
                for (b, line_b) in &types[i + 1..] {
                    edges
                        .entry((pattern_concept(a), pattern_concept(b), RelationKind::RelatedTo))
                        .or_default()
                        .insert(Evidence {
                            file: path.to_string(),
                            line: (*line_a).min(*line_b),
                        });
                }
            }

            // --- Imports of other known files ---
            for el in r.scan.elements.iter().filter(|e| e.kind == ElementKind::Import) {
                let Some(target) = index.resolve(path, r.scan.file.language, &el.name) else {
                    continue;
                };
                if target == path {
                    continue;
                }
                let target_concept = module_concept(&target);
                let category = categories.get(target.as_str()).copied().unwrap_or(MODULE_CATEGORY);
                concepts.observe(&target_concept, category, 0.0, 0);
                edges
                    .entry((owner.clone(), target_concept, RelationKind::DependsOn))
                    .or_default()
                    .insert(Evidence {
                        file: path.to_string(),
                        line: el.line_start,
                    });
            }
        }

        out.concepts = concepts.finish();
        out.relationships = edges
            .into_iter()
            .map(|((source, target, kind), evidence)| RelationshipObservation {
                source,
                target,
                kind,
                evidence: evidence.into_iter().collect(),
            })
            .collect();

        debug!(
            processed = out.files_processed,
            records = out.records.len(),
            concepts = out.concepts.len(),
            relationships = out.relationships.len(),
            "extraction complete"
        );
        out
    }
}

/// Aggregates per-run concept references by name.
#[derive(Default)]
struct ConceptAccumulator {
    by_name: BTreeMap<String, ConceptObservation>,
}

impl ConceptAccumulator {
    fn observe(&mut self, name: &str, category: &str, importance: f64, occurrences: u64) {
        let entry = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| ConceptObservation {
                name: name.to_string(),
                category: category.to_string(),
                importance: 0.0,
                occurrences: 0,
            });
        if entry.occurrences == 0 && occurrences > 0 {
            entry.category = category.to_string();
        }
        entry.occurrences += occurrences;
        entry.importance = entry.importance.max(importance);
    }

    fn finish(self) -> Vec<ConceptObservation> {
        self.by_name.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codelore_shared::{
        Classification, CodeElement, DiscoveredFile, Language, ParserKind, Pattern, ScanResult,
    };

    fn classified(path: &str, importance: f64, elements: Vec<CodeElement>, patterns: &[(&str, u32)]) -> ClassifiedResult {
        ClassifiedResult {
            scan: ScanResult {
                file: DiscoveredFile {
                    path: path.into(),
                    size: 1,
                    language: Language::from_path(std::path::Path::new(path)),
                    score: 0.5,
                    content_hash: None,
                    oversized: false,
                    discovered_at: Utc::now(),
                    last_analyzed: Utc::now(),
                },
                elements,
                patterns: patterns
                    .iter()
                    .map(|(t, line)| Pattern {
                        pattern_type: t.to_string(),
                        value: t.to_string(),
                        line: *line,
                        confidence: 0.8,
                    })
                    .collect(),
                parser: ParserKind::Structural,
            },
            classification: Classification {
                path: path.into(),
                category: "source".into(),
                subcategory: None,
                importance,
                tags: Vec::new(),
            },
        }
    }

    fn async_fn(name: &str, line: u32) -> CodeElement {
        let mut el = CodeElement::new(ElementKind::Function, name, line, 1.0);
        el.is_async = true;
        el
    }

    #[test]
    fn module_concept_names() {
        assert_eq!(module_concept("pkg/core.py"), "module:pkg/core");
        assert_eq!(module_concept("main.rs"), "module:main");
        assert_eq!(module_concept("Makefile"), "module:Makefile");
        assert_eq!(module_concept(".env"), "module:.env");
    }

    #[test]
    fn async_file_yields_record_with_provenance() {
        let import = CodeElement::new(ElementKind::Import, "asyncio", 1, 1.0);
        let r = classified("svc/fetch.py", 4.0, vec![import, async_fn("fetch", 3)], &[("async", 1), ("async", 3)]);

        let out = Extractor::default().extract(&[r], 3.0);
        assert_eq!(out.files_processed, 1);
        assert_eq!(out.records.len(), 1);
        let rec = &out.records[0];
        assert_eq!(rec.kind, ExtractionKind::AsyncFunction);
        assert_eq!((rec.file.as_str(), rec.line), ("svc/fetch.py", 3));

        let names: Vec<_> = out.concepts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["kind:async_function", "module:svc/fetch", "pattern:async"]);
        // asyncio is not a known file.
        assert!(out.relationships.is_empty());
    }

    #[test]
    fn threshold_filters_files() {
        let low = classified("a.py", 2.9, vec![async_fn("f", 1)], &[("async", 1)]);
        let high = classified("b.py", 3.0, vec![async_fn("g", 1)], &[("async", 1)]);
        let out = Extractor::default().extract(&[low, high], 3.0);
        assert_eq!(out.files_processed, 1);
        assert!(out.records.iter().all(|r| r.file == "b.py"));
    }

    #[test]
    fn imports_of_known_files_create_depends_on() {
        let main = classified(
            "app/main.py",
            5.0,
            vec![CodeElement::new(ElementKind::Import, "app.store", 2, 1.0)],
            &[],
        );
        let store = classified("app/store.py", 0.5, vec![], &[]);
        let out = Extractor::default().extract(&[main, store], 3.0);

        assert_eq!(out.relationships.len(), 1);
        let rel = &out.relationships[0];
        assert_eq!(rel.kind, RelationKind::DependsOn);
        assert_eq!((rel.source.as_str(), rel.target.as_str()), ("module:app/main", "module:app/store"));
        assert_eq!(rel.evidence, vec![Evidence { file: "app/main.py".into(), line: 2 }]);

        let target = out.concepts.iter().find(|c| c.name == "module:app/store").unwrap();
        assert_eq!(target.occurrences, 0);
    }

    #[test]
    fn imports_resolve_against_previously_known_files() {
        let main = classified(
            "main.py",
            5.0,
            vec![CodeElement::new(ElementKind::Import, "lib.util", 1, 1.0)],
            &[],
        );
        let extractor = Extractor::new(ModuleIndex::new(["lib/util.py"]));
        let out = extractor.extract(&[main], 3.0);
        assert_eq!(out.relationships[0].target, "module:lib/util");
        assert_eq!(
            out.concepts.iter().find(|c| c.name == "module:lib/util").unwrap().category,
            MODULE_CATEGORY
        );
    }

    #[test]
    fn co_occurring_patterns_are_related() {
        let a = classified("a.py", 5.0, vec![], &[("llm", 4), ("agent", 2), ("async", 9)]);
        let b = classified("b.py", 5.0, vec![], &[("agent", 1), ("llm", 1)]);
        let out = Extractor::default().extract(&[a, b], 3.0);

        let rel = out
            .relationships
            .iter()
            .find(|r| r.source == "pattern:agent" && r.target == "pattern:llm")
            .unwrap();
        assert_eq!(rel.kind, RelationKind::RelatedTo);
        assert_eq!(
            rel.evidence,
            vec![
                Evidence { file: "a.py".into(), line: 2 },
                Evidence { file: "b.py".into(), line: 1 },
            ]
        );
        assert!(out.relationships.iter().all(|r| r.source < r.target));

        let agent = out.concepts.iter().find(|c| c.name == "pattern:agent").unwrap();
        assert_eq!(agent.occurrences, 2);
    }
}
