//! Fixed keyword → pattern-type dictionary, run over every scanned file.

use std::sync::LazyLock;

use regex::Regex;

use codelore_shared::Pattern;

/// Longest recorded match value.
const MAX_VALUE_LEN: usize = 120;

/// One dictionary entry.
pub struct PatternRule {
    pub pattern_type: &'static str,
    pub regex: Regex,
    pub confidence: f64,
}

fn rule(pattern_type: &'static str, re: &str, confidence: f64) -> PatternRule {
    PatternRule {
        pattern_type,
        regex: Regex::new(re).expect("pattern dictionary regex"),
        confidence,
    }
}

/// The dictionary, in a fixed order so hit lists are reproducible.
pub static DICTIONARY: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        rule(
            "async",
            r"\basync\s+(?:def|fn|function)\b|\bawait\b|\basyncio\b|\bPromise\.all\b",
            0.9,
        ),
        rule("agent", r"\b[A-Z]\w*Agent\b|\b(?i:agent(?:s|ic)?)\b", 0.75),
        rule(
            "llm",
            r"(?i)\b(?:openai|anthropic|llm|chat\.completions|chatcompletion|gpt-[\w.]+|claude[\w.-]*|ollama|generate_content)\b",
            0.85,
        ),
        rule(
            "mcp",
            r"\b(?i:mcp)(?:_\w+)?\b|\bModelContextProtocol\b|\bFastMCP\b",
            0.9,
        ),
        rule(
            "tool",
            r"@tool\b|\btool_calls?\b|\bregister_tool\b|\bfunction_call\b|\bTool\b",
            0.8,
        ),
        rule(
            "workflow",
            r"\b(?i:workflow|pipeline)s?\b|\bStateGraph\b|\bDAG\b",
            0.7,
        ),
        rule(
            "memory",
            r"(?i)\b(?:memory|vector_?store|embeddings?|retriever)\b",
            0.7,
        ),
        rule(
            "prompt",
            r"(?i)\b(?:prompt|system_prompt|system_message|few_shot)s?\b",
            0.7,
        ),
        rule(
            "orchestration",
            r"(?i)\b(?:orchestrat\w*|coordinator|dispatcher|scheduler)\b",
            0.7,
        ),
        rule(
            "concurrency",
            r"\b(?:Mutex|RwLock|Semaphore|ThreadPool\w*|threading|tokio::spawn)\b|\basyncio\.gather\b",
            0.75,
        ),
        rule(
            "testing",
            r"\bdef test_\w+|#\[(?:tokio::)?test\]|\bdescribe\(|\bpytest\b|\bunittest\b",
            0.8,
        ),
        rule(
            "error_handling",
            r"\bexcept\b|\btry\s*[:{]|\bcatch\s*\(|\bResult<|\braise\b|\bpanic!",
            0.6,
        ),
        rule(
            "api",
            r"@app\.(?:get|post|put|delete|route)\b|\bFastAPI\b|\bRouter\b|\bexpress\(\)|\baxum\b",
            0.7,
        ),
    ]
});

/// Run the dictionary over `source`, recording at most `limit` hits.
///
/// Hits are ordered by line, then by dictionary order, then by column.
pub fn detect_patterns(source: &str, limit: usize) -> Vec<Pattern> {
    let mut hits = Vec::new();

    'lines: for (idx, line) in source.lines().enumerate() {
        for rule in DICTIONARY.iter() {
            for m in rule.regex.find_iter(line) {
                if hits.len() >= limit {
                    break 'lines;
                }
                hits.push(Pattern {
                    pattern_type: rule.pattern_type.to_string(),
                    value: truncate(m.as_str().trim(), MAX_VALUE_LEN),
                    line: idx as u32 + 1,
                    confidence: rule.confidence,
                });
            }
        }
    }

    hits
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
