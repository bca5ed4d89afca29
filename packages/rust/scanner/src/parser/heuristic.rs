//! Regex-based element heuristics.
//!
//! Line-oriented, so it never fails on malformed input; it only fails for
//! languages it has no rules for. Python ranges are recovered from
//! indentation; other languages get single-line ranges.

use std::sync::LazyLock;

use regex::Regex;

use codelore_shared::{CodeElement, ElementKind, Language, LoreError, ParserKind, Result};

use super::ElementParser;

/// Confidence assigned to heuristic elements.
pub const HEURISTIC_CONFIDENCE: f64 = 0.6;

/// Per-language line rules. Capture names: `name`, `async`, `bases`, `module`.
struct Rules {
    function: Vec<Regex>,
    class: Regex,
    imports: Vec<Regex>,
    decorator: Option<Regex>,
    /// Block import syntax (`import ( ... )`): opener and per-line item.
    import_block: Option<(Regex, Regex)>,
    indent_scoped: bool,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("heuristic regex")
}

static PYTHON: LazyLock<Rules> = LazyLock::new(|| Rules {
    function: vec![re(r"^\s*(?P<async>async\s+)?def\s+(?P<name>[A-Za-z_]\w*)")],
    class: re(r"^\s*class\s+(?P<name>[A-Za-z_]\w*)\s*(?:\((?P<bases>[^)]*)\))?"),
    imports: vec![
        re(r"^\s*from\s+(?P<module>\.*[\w.]*)\s+import\b"),
        re(r"^\s*import\s+(?P<module>[\w.]+)"),
    ],
    decorator: Some(re(r"^\s*@(?P<name>[\w.]+)")),
    import_block: None,
    indent_scoped: true,
});

static RUST: LazyLock<Rules> = LazyLock::new(|| Rules {
    function: vec![re(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?P<async>async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(?P<name>[A-Za-z_]\w*)"#,
    )],
    class: re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+(?P<name>[A-Za-z_]\w*)"),
    imports: vec![re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(?P<module>[\w:]+)")],
    decorator: Some(re(r"^\s*#\[(?P<name>[\w:]+)")),
    import_block: None,
    indent_scoped: false,
});

static JAVASCRIPT: LazyLock<Rules> = LazyLock::new(|| Rules {
    function: vec![
        re(r"^\s*(?:export\s+)?(?:default\s+)?(?P<async>async\s+)?function\*?\s+(?P<name>[A-Za-z_$][\w$]*)"),
        re(r"^\s*(?:export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?P<async>async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=>"),
    ],
    class: re(r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)(?:\s+extends\s+(?P<bases>[\w$.]+))?"),
    imports: vec![
        re(r#"^\s*import\s+(?:.+?\s+from\s+)?['"](?P<module>[^'"]+)['"]"#),
        re(r#"\brequire\(\s*['"](?P<module>[^'"]+)['"]\s*\)"#),
    ],
    decorator: Some(re(r"^\s*@(?P<name>[\w.]+)")),
    import_block: None,
    indent_scoped: false,
});

static GO: LazyLock<Rules> = LazyLock::new(|| Rules {
    function: vec![re(r"^func\s+(?:\([^)]*\)\s*)?(?P<name>[A-Za-z_]\w*)")],
    class: re(r"^type\s+(?P<name>[A-Za-z_]\w*)\s+(?:struct|interface)\b"),
    imports: vec![re(r#"^\s*import\s+(?:\w+\s+)?"(?P<module>[^"]+)""#)],
    decorator: None,
    import_block: Some((re(r"^\s*import\s*\($"), re(r#"^\s*(?:\w+\s+)?"(?P<module>[^"]+)""#))),
    indent_scoped: false,
});

static JAVA: LazyLock<Rules> = LazyLock::new(|| Rules {
    function: vec![re(
        r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|default)\s+)+[\w<>\[\],.?\s]+?\s+(?P<name>[a-zA-Z_]\w*)\s*\(",
    )],
    class: re(r"^\s*(?:(?:public|private|protected|static|final|abstract)\s+)*(?:class|interface|enum|record)\s+(?P<name>[A-Za-z_]\w*)(?:<[^>]*>)?(?:\s+(?:extends|implements)\s+(?P<bases>[\w.]+))?"),
    imports: vec![re(r"^\s*import\s+(?:static\s+)?(?P<module>[\w.]+)")],
    decorator: Some(re(r"^\s*@(?P<name>[\w.]+)")),
    import_block: None,
    indent_scoped: false,
});

fn rules_for(language: Language) -> Option<&'static Rules> {
    match language {
        Language::Python => Some(&PYTHON),
        Language::Rust => Some(&RUST),
        Language::JavaScript | Language::TypeScript => Some(&JAVASCRIPT),
        Language::Go => Some(&GO),
        Language::Java => Some(&JAVA),
        _ => None,
    }
}

/// Line-regex parser for one language.
pub struct HeuristicParser {
    language: Language,
}

impl HeuristicParser {
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

impl ElementParser for HeuristicParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Heuristic
    }

    fn parse(&self, source: &str) -> Result<Vec<CodeElement>> {
        let rules = rules_for(self.language).ok_or_else(|| {
            LoreError::parse(format!("no heuristics for {}", self.language.as_str()))
        })?;

        let lines: Vec<&str> = source.lines().collect();
        let mut elements = Vec::new();
        let mut pending_decorators: Vec<String> = Vec::new();
        let mut in_import_block = false;

        for (idx, line) in lines.iter().enumerate() {
            let line_no = idx as u32 + 1;

            if let Some((open, item)) = &rules.import_block {
                if in_import_block {
                    if line.trim() == ")" {
                        in_import_block = false;
                    } else if let Some(caps) = item.captures(line) {
                        elements.push(import(&caps["module"], line_no));
                    }
                    continue;
                }
                if open.is_match(line) {
                    in_import_block = true;
                    continue;
                }
            }

            if let Some(caps) = rules.decorator.as_ref().and_then(|d| d.captures(line)) {
                pending_decorators.push(caps["name"].to_string());
                continue;
            }

            if let Some(caps) = rules.class.captures(line) {
                let bases = caps
                    .name("bases")
                    .map(|b| split_bases(b.as_str()))
                    .unwrap_or_default();
                elements.push(CodeElement {
                    kind: ElementKind::Class,
                    name: caps["name"].to_string(),
                    line_start: line_no,
                    line_end: scope_end(rules, &lines, idx),
                    is_async: false,
                    bases,
                    decorators: std::mem::take(&mut pending_decorators),
                    confidence: HEURISTIC_CONFIDENCE,
                });
                continue;
            }

            if let Some(caps) = rules.function.iter().find_map(|f| f.captures(line)) {
                elements.push(CodeElement {
                    kind: ElementKind::Function,
                    name: caps["name"].to_string(),
                    line_start: line_no,
                    line_end: scope_end(rules, &lines, idx),
                    is_async: caps.name("async").is_some(),
                    bases: Vec::new(),
                    decorators: std::mem::take(&mut pending_decorators),
                    confidence: HEURISTIC_CONFIDENCE,
                });
                continue;
            }

            if let Some(caps) = rules.imports.iter().find_map(|i| i.captures(line)) {
                let module = caps["module"].to_string();
                if !module.is_empty() {
                    elements.push(import(&module, line_no));
                }
                continue;
            }

            if !line.trim().is_empty() {
                pending_decorators.clear();
            }
        }

        Ok(elements)
    }
}

fn import(module: &str, line: u32) -> CodeElement {
    CodeElement::new(ElementKind::Import, module, line, HEURISTIC_CONFIDENCE)
}

/// `"Base, metaclass=Meta, pkg.Mixin"` → `["Base", "pkg.Mixin"]`.
fn split_bases(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty() && !b.contains('='))
        .map(String::from)
        .collect()
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Last line of the block opened at `idx`: the last non-blank line before the
/// next non-blank line indented at or below the opener.
fn scope_end(rules: &Rules, lines: &[&str], idx: usize) -> u32 {
    if !rules.indent_scoped {
        return idx as u32 + 1;
    }
    let base = indent_of(lines[idx]);
    let mut end = idx;
    for (j, line) in lines.iter().enumerate().skip(idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base {
            break;
        }
        end = j;
    }
    end as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(language: Language, src: &str) -> Vec<CodeElement> {
        HeuristicParser::new(language).parse(src).expect("parse")
    }

    #[test]
    fn python_ranges_from_indentation() {
        let src = "@tool\nasync def search(q):\n    x = 1\n\n    return x\n\ndef other():\n    pass\n";
        let elements = parse(Language::Python, src);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].name, "search");
        assert!(elements[0].is_async);
        assert_eq!(elements[0].decorators, vec!["tool"]);
        assert_eq!((elements[0].line_start, elements[0].line_end), (2, 5));
        assert_eq!((elements[1].line_start, elements[1].line_end), (7, 8));
        assert!(elements[1].decorators.is_empty());
    }

    #[test]
    fn python_class_bases_skip_keywords() {
        let src = "class Bot(BaseAgent, metaclass=ABCMeta):\n    pass\n";
        let elements = parse(Language::Python, src);
        assert_eq!(elements[0].bases, vec!["BaseAgent"]);
    }

    #[test]
    fn typescript_functions_classes_imports() {
        let src = "import { Agent } from './agent';\n\
                   export async function run() {}\n\
                   const handler = async (req) => req;\n\
                   export class Router extends BaseRouter {}\n\
                   const fs = require('fs');\n";
        let elements = parse(Language::TypeScript, src);
        let summary: Vec<_> = elements
            .iter()
            .map(|e| (e.kind, e.name.as_str(), e.is_async))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ElementKind::Import, "./agent", false),
                (ElementKind::Function, "run", true),
                (ElementKind::Function, "handler", true),
                (ElementKind::Class, "Router", false),
                (ElementKind::Import, "fs", false),
            ]
        );
        assert_eq!(elements[3].bases, vec!["BaseRouter"]);
    }

    #[test]
    fn rust_items() {
        let src = "use crate::store::Storage;\n#[tokio::main]\npub async fn main() {}\npub(crate) struct Engine;\n";
        let elements = parse(Language::Rust, src);
        assert_eq!(elements[0].name, "crate::store::Storage");
        assert_eq!(elements[1].name, "main");
        assert_eq!(elements[1].decorators, vec!["tokio::main"]);
        assert_eq!(elements[2].kind, ElementKind::Class);
    }

    #[test]
    fn go_import_blocks() {
        let src = "package main\n\nimport (\n\t\"fmt\"\n\tlog \"github.com/x/log\"\n)\n\nfunc (s *Server) Start() {}\ntype Server struct {\n}\n";
        let elements = parse(Language::Go, src);
        let names: Vec<_> = elements.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["fmt", "github.com/x/log", "Start", "Server"]);
    }

    #[test]
    fn unsupported_language_errors() {
        assert!(HeuristicParser::new(Language::Markdown).parse("# x").is_err());
    }
}
