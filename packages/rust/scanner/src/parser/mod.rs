//! Element parsers.
//!
//! Two variants share the [`ElementParser`] capability:
//! - [`PythonStructuralParser`]: tree-sitter, exact ranges and qualifiers
//! - [`HeuristicParser`]: line regexes, lower confidence, many languages
//!
//! [`parse_elements`] picks the structural parser when one exists for the
//! language and falls back to heuristics when it fails.

mod heuristic;
mod python;

use tracing::debug;

use codelore_shared::{CodeElement, Language, ParserKind, Result};

pub use heuristic::{HEURISTIC_CONFIDENCE, HeuristicParser};
pub use python::PythonStructuralParser;

/// Something that turns source text into code elements.
pub trait ElementParser {
    /// Which variant this is.
    fn kind(&self) -> ParserKind;

    /// Parse `source`. An `Err` means the caller should try another parser.
    fn parse(&self, source: &str) -> Result<Vec<CodeElement>>;
}

/// The structural parser available for `language`, if any.
pub fn structural_parser(language: Language) -> Option<Box<dyn ElementParser>> {
    match language {
        Language::Python => Some(Box::new(PythonStructuralParser)),
        _ => None,
    }
}

/// Parse with the best available parser, degrading to heuristics on failure.
///
/// Returns no elements and [`ParserKind::None`] when neither variant applies.
pub fn parse_elements(language: Language, source: &str) -> (Vec<CodeElement>, ParserKind) {
    if let Some(parser) = structural_parser(language) {
        match parser.parse(source) {
            Ok(elements) => return (elements, parser.kind()),
            Err(e) => {
                debug!(language = language.as_str(), error = %e, "structural parse failed, using heuristics");
            }
        }
    }

    let heuristic = HeuristicParser::new(language);
    match heuristic.parse(source) {
        Ok(elements) => (elements, heuristic.kind()),
        Err(_) => (Vec::new(), ParserKind::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelore_shared::ElementKind;

    #[test]
    fn python_uses_structural_parser() {
        let (elements, kind) = parse_elements(Language::Python, "def f():\n    return 1\n");
        assert_eq!(kind, ParserKind::Structural);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].confidence, 1.0);
    }

    #[test]
    fn broken_python_falls_back_to_heuristics() {
        let src = "def ok():\n    pass\n\ndef broken(:\n    pass\n";
        let (elements, kind) = parse_elements(Language::Python, src);
        assert_eq!(kind, ParserKind::Heuristic);
        let names: Vec<_> = elements
            .iter()
            .filter(|e| e.kind == ElementKind::Function)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["ok", "broken"]);
        assert!(elements.iter().all(|e| e.confidence < 1.0));
    }

    #[test]
    fn rust_uses_heuristics() {
        let (elements, kind) = parse_elements(Language::Rust, "pub async fn serve() {}\n");
        assert_eq!(kind, ParserKind::Heuristic);
        assert!(elements[0].is_async);
    }

    #[test]
    fn unknown_language_is_not_parsed() {
        let (elements, kind) = parse_elements(Language::Markdown, "# Title\n");
        assert!(elements.is_empty());
        assert_eq!(kind, ParserKind::None);
    }
}
