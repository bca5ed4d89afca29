//! Python structural parser using native tree-sitter.
//!
//! Extracts functions (with `async` and decorators), classes (with bases),
//! and imports. Any syntax error in the tree rejects the whole file so the
//! caller can degrade to heuristics.

use tree_sitter::{Node, Parser};

use codelore_shared::{CodeElement, ElementKind, LoreError, ParserKind, Result};

use super::ElementParser;

/// Python parser backed by `tree-sitter-python`.
pub struct PythonStructuralParser;

impl ElementParser for PythonStructuralParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Structural
    }

    fn parse(&self, source: &str) -> Result<Vec<CodeElement>> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| LoreError::parse(format!("failed to load python grammar: {e}")))?;

        let tree = parser
            .parse(source, None)
            .ok_or_else(|| LoreError::parse("tree-sitter produced no tree"))?;

        let root = tree.root_node();
        if root.has_error() {
            let line = first_error_line(root).unwrap_or(0);
            return Err(LoreError::parse(format!("syntax error near line {line}")));
        }

        let mut elements = Vec::new();
        visit(root, source.as_bytes(), Vec::new(), &mut elements);
        Ok(elements)
    }
}

fn text(node: Node<'_>, source: &[u8]) -> String {
    node.utf8_text(source).unwrap_or_default().to_string()
}

fn line_range(node: Node<'_>) -> (u32, u32) {
    (
        node.start_position().row as u32 + 1,
        node.end_position().row as u32 + 1,
    )
}

fn first_error_line(node: Node<'_>) -> Option<u32> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row as u32 + 1);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(line) = first_error_line(child) {
                return Some(line);
            }
        }
    }
    None
}

/// `@app.tool(name="x")` → `app.tool`.
fn decorator_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('@').trim();
    trimmed
        .split('(')
        .next()
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn visit(node: Node<'_>, source: &[u8], decorators: Vec<String>, out: &mut Vec<CodeElement>) {
    match node.kind() {
        "decorated_definition" => {
            let mut names = Vec::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "decorator" {
                    names.push(decorator_name(&text(child, source)));
                }
            }
            if let Some(definition) = node.child_by_field_name("definition") {
                visit(definition, source, names, out);
            }
        }
        "function_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                let (line_start, line_end) = line_range(node);
                let mut cursor = node.walk();
                let is_async = node.children(&mut cursor).any(|c| c.kind() == "async");
                out.push(CodeElement {
                    kind: ElementKind::Function,
                    name: text(name, source),
                    line_start,
                    line_end,
                    is_async,
                    bases: Vec::new(),
                    decorators,
                    confidence: 1.0,
                });
            }
            visit_children(node, source, out);
        }
        "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                let (line_start, line_end) = line_range(node);
                let mut bases = Vec::new();
                if let Some(args) = node.child_by_field_name("superclasses") {
                    let mut cursor = args.walk();
                    for arg in args.named_children(&mut cursor) {
                        if matches!(arg.kind(), "identifier" | "attribute") {
                            bases.push(text(arg, source));
                        }
                    }
                }
                out.push(CodeElement {
                    kind: ElementKind::Class,
                    name: text(name, source),
                    line_start,
                    line_end,
                    is_async: false,
                    bases,
                    decorators,
                    confidence: 1.0,
                });
            }
            visit_children(node, source, out);
        }
        "import_statement" => {
            let (line_start, line_end) = line_range(node);
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                let module = match child.kind() {
                    "dotted_name" => Some(child),
                    "aliased_import" => child.child_by_field_name("name"),
                    _ => None,
                };
                if let Some(module) = module {
                    let mut el = CodeElement::new(ElementKind::Import, text(module, source), line_start, 1.0);
                    el.line_end = line_end;
                    out.push(el);
                }
            }
        }
        "import_from_statement" => {
            if let Some(module) = node.child_by_field_name("module_name") {
                let (line_start, line_end) = line_range(node);
                let mut el = CodeElement::new(ElementKind::Import, text(module, source), line_start, 1.0);
                el.line_end = line_end;
                out.push(el);
            }
        }
        _ => visit_children(node, source, out),
    }
}

fn visit_children(node: Node<'_>, source: &[u8], out: &mut Vec<CodeElement>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        visit(child, source, Vec::new(), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<CodeElement> {
        PythonStructuralParser.parse(src).expect("parse")
    }

    #[test]
    fn async_function_and_import() {
        let src = "import asyncio\n\nasync def fetch(url):\n    await asyncio.sleep(1)\n    return url\n";
        let elements = parse(src);
        assert_eq!(elements.len(), 2);

        assert_eq!(elements[0].kind, ElementKind::Import);
        assert_eq!(elements[0].name, "asyncio");
        assert_eq!(elements[0].line_start, 1);

        let func = &elements[1];
        assert_eq!(func.kind, ElementKind::Function);
        assert_eq!(func.name, "fetch");
        assert!(func.is_async);
        assert_eq!((func.line_start, func.line_end), (3, 5));
    }

    #[test]
    fn class_with_bases_and_methods() {
        let src = "class Planner(BaseAgent, mixins.Loggable):\n    def plan(self):\n        pass\n";
        let elements = parse(src);
        assert_eq!(elements[0].kind, ElementKind::Class);
        assert_eq!(elements[0].bases, vec!["BaseAgent", "mixins.Loggable"]);
        assert_eq!(elements[1].name, "plan");
        assert!(!elements[1].is_async);
    }

    #[test]
    fn decorators_are_attached() {
        let src = "@tool(name=\"search\")\ndef search(q):\n    return q\n";
        let elements = parse(src);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].decorators, vec!["tool"]);
    }

    #[test]
    fn from_imports_keep_relative_dots() {
        let src = "from .utils import helper\nfrom pkg.core import Engine as E\nimport os.path as p, json\n";
        let names: Vec<_> = parse(src).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![".utils", "pkg.core", "os.path", "json"]);
    }

    #[test]
    fn syntax_error_is_rejected() {
        let err = PythonStructuralParser.parse("def broken(:\n    pass\n").unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn decorator_name_normalization() {
        assert_eq!(decorator_name("@app.get(\"/\")"), "app.get");
        assert_eq!(decorator_name("@ staticmethod"), "staticmethod");
    }
}
