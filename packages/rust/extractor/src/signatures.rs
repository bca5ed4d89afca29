//! Structural signatures that turn elements and patterns into typed records.

use std::collections::BTreeSet;

use codelore_shared::{CodeElement, ElementKind, ExtractionKind, ExtractionRecord, ScanResult};

/// Last `.`/`::` separated segment of a dotted name.
fn last_segment(name: &str) -> &str {
    name.rsplit(['.', ':']).next().unwrap_or(name)
}

fn is_agent_class(el: &CodeElement) -> Option<f64> {
    if el.kind != ElementKind::Class {
        return None;
    }
    if el.bases.iter().any(|b| last_segment(b).ends_with("Agent")) {
        Some(0.9)
    } else if el.name.ends_with("Agent") {
        Some(0.7)
    } else {
        None
    }
}

fn is_tool_function(el: &CodeElement) -> Option<f64> {
    if el.kind != ElementKind::Function {
        return None;
    }
    let decorated = el.decorators.iter().any(|d| {
        let last = last_segment(d).to_ascii_lowercase();
        last == "tool" || last.ends_with("_tool") || last.starts_with("tool_")
    });
    if decorated {
        Some(0.9)
    } else if el.name.starts_with("tool_") || el.name.ends_with("_tool") {
        Some(0.6)
    } else {
        None
    }
}

fn is_workflow(el: &CodeElement) -> bool {
    if el.kind == ElementKind::Import {
        return false;
    }
    let lower = el.name.to_ascii_lowercase();
    lower.contains("workflow") || lower.contains("pipeline") || el.name.ends_with("Graph")
}

fn is_mcp_import(el: &CodeElement) -> bool {
    el.kind == ElementKind::Import
        && el
            .name
            .split(['.', '/', ':', '-', '_', '@'])
            .any(|seg| seg.eq_ignore_ascii_case("mcp") || seg.eq_ignore_ascii_case("modelcontextprotocol"))
}

fn record(kind: ExtractionKind, file: &str, line: u32, name: &str, confidence: f64) -> ExtractionRecord {
    ExtractionRecord {
        kind,
        file: file.to_string(),
        line,
        name: name.to_string(),
        confidence: confidence.clamp(0.0, 1.0),
    }
}

/// All records for one file, ordered by line then kind.
pub fn match_signatures(result: &ScanResult) -> Vec<ExtractionRecord> {
    let file = result.file.path.as_str();
    let mut out = Vec::new();

    for el in &result.elements {
        if let Some(c) = is_agent_class(el) {
            out.push(record(ExtractionKind::AgentClass, file, el.line_start, &el.name, c * el.confidence));
        }
        if el.kind == ElementKind::Function && el.is_async {
            out.push(record(ExtractionKind::AsyncFunction, file, el.line_start, &el.name, el.confidence));
        }
        if let Some(c) = is_tool_function(el) {
            out.push(record(ExtractionKind::ToolFunction, file, el.line_start, &el.name, c * el.confidence));
        }
        if is_mcp_import(el) {
            out.push(record(ExtractionKind::McpIntegration, file, el.line_start, &el.name, el.confidence));
        }
        if is_workflow(el) {
            out.push(record(ExtractionKind::WorkflowDefinition, file, el.line_start, &el.name, 0.8 * el.confidence));
        }
    }

    // Pattern-only signatures: one record per line.
    let has_mcp_import = out.iter().any(|r| r.kind == ExtractionKind::McpIntegration);
    let mut seen: BTreeSet<(ExtractionKind, u32)> = BTreeSet::new();
    for p in &result.patterns {
        let kind = match p.pattern_type.as_str() {
            "llm" => ExtractionKind::LlmCall,
            "mcp" if !has_mcp_import => ExtractionKind::McpIntegration,
            "workflow" if p.value == "StateGraph" => ExtractionKind::WorkflowDefinition,
            _ => continue,
        };
        if seen.insert((kind, p.line)) {
            out.push(record(kind, file, p.line, &p.value, p.confidence));
        }
    }

    out.sort_by(|a, b| a.line.cmp(&b.line).then(a.kind.cmp(&b.kind)).then(a.name.cmp(&b.name)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codelore_shared::{DiscoveredFile, Language, ParserKind, Pattern};

    fn scan(elements: Vec<CodeElement>, patterns: Vec<(&str, &str, u32)>) -> ScanResult {
        ScanResult {
            file: DiscoveredFile {
                path: "agents/bot.py".into(),
                size: 1,
                language: Language::Python,
                score: 0.5,
                content_hash: None,
                oversized: false,
                discovered_at: Utc::now(),
                last_analyzed: Utc::now(),
            },
            elements,
            patterns: patterns
                .into_iter()
                .map(|(t, v, line)| Pattern {
                    pattern_type: t.into(),
                    value: v.into(),
                    line,
                    confidence: 0.8,
                })
                .collect(),
            parser: ParserKind::Structural,
        }
    }

    fn kinds(records: &[ExtractionRecord]) -> Vec<ExtractionKind> {
        records.iter().map(|r| r.kind).collect()
    }

    #[test]
    fn agent_class_by_base_or_name() {
        let mut by_base = CodeElement::new(ElementKind::Class, "Planner", 3, 1.0);
        by_base.bases = vec!["framework.BaseAgent".into()];
        let by_name = CodeElement::new(ElementKind::Class, "ResearchAgent", 10, 1.0);
        let plain = CodeElement::new(ElementKind::Class, "Config", 20, 1.0);

        let records = match_signatures(&scan(vec![by_base, by_name, plain], vec![]));
        assert_eq!(kinds(&records), vec![ExtractionKind::AgentClass, ExtractionKind::AgentClass]);
        assert!(records[0].confidence > records[1].confidence);
    }

    #[test]
    fn async_and_tool_functions() {
        let mut f = CodeElement::new(ElementKind::Function, "search", 5, 1.0);
        f.is_async = true;
        f.decorators = vec!["mcp.tool".into()];
        let named = CodeElement::new(ElementKind::Function, "tool_fetch", 9, 0.6);

        let records = match_signatures(&scan(vec![f, named], vec![]));
        assert_eq!(
            kinds(&records),
            vec![ExtractionKind::AsyncFunction, ExtractionKind::ToolFunction, ExtractionKind::ToolFunction]
        );
        assert_eq!(records[0].line, 5);
        assert!((records[2].confidence - 0.36).abs() < 1e-9);
    }

    #[test]
    fn mcp_import_suppresses_pattern_records() {
        let import = CodeElement::new(ElementKind::Import, "mcp.server", 1, 1.0);
        let records = match_signatures(&scan(vec![import], vec![("mcp", "mcp", 1), ("mcp", "MCP", 7)]));
        assert_eq!(kinds(&records), vec![ExtractionKind::McpIntegration]);

        let records = match_signatures(&scan(vec![], vec![("mcp", "mcp", 4)]));
        assert_eq!(records[0].line, 4);
    }

    #[test]
    fn llm_calls_are_one_per_line() {
        let records = match_signatures(&scan(
            vec![],
            vec![("llm", "OpenAI", 2), ("llm", "chat.completions", 2), ("llm", "anthropic", 6)],
        ));
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.kind == ExtractionKind::LlmCall));
    }

    #[test]
    fn workflows_from_names_and_state_graph() {
        let class = CodeElement::new(ElementKind::Class, "ReviewWorkflow", 1, 1.0);
        let func = CodeElement::new(ElementKind::Function, "build_pipeline", 8, 1.0);
        let records = match_signatures(&scan(vec![class, func], vec![("workflow", "StateGraph", 12)]));
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.kind == ExtractionKind::WorkflowDefinition));
    }
}
