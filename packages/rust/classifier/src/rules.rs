//! Ordered classification rule table.
//!
//! Rules are evaluated top to bottom and the first match wins, so the table
//! lists the most specific predicates first: directory segments, then file
//! name globs, then bare extensions.

use std::path::Path;

use globset::{Glob, GlobMatcher};

use codelore_shared::{LoreError, Result};

/// What a rule looks at.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Any directory component equals one of these (case-insensitive).
    PathSegment(Vec<String>),
    /// The file name matches this glob.
    FileGlob(String),
    /// The extension is one of these (case-insensitive, no dot).
    Extension(Vec<String>),
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub predicate: Predicate,
    pub category: String,
    pub subcategory: Option<String>,
    /// Category weight in `[0, 1]`.
    pub weight: f64,
}

impl Rule {
    fn new(
        name: &str,
        predicate: Predicate,
        category: &str,
        subcategory: Option<&str>,
        weight: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            predicate,
            category: category.to_string(),
            subcategory: subcategory.map(str::to_string),
            weight,
        }
    }
}

fn segments(names: &[&str]) -> Predicate {
    Predicate::PathSegment(names.iter().map(|s| s.to_string()).collect())
}

fn glob(pattern: &str) -> Predicate {
    Predicate::FileGlob(pattern.to_string())
}

fn extensions(exts: &[&str]) -> Predicate {
    Predicate::Extension(exts.iter().map(|s| s.to_string()).collect())
}

/// Category for files no rule matches.
pub const UTILITY_CATEGORY: &str = "utility";
/// Category weight for the utility fallback.
pub const UTILITY_WEIGHT: f64 = 0.1;

/// The built-in table.
pub fn default_rules() -> Vec<Rule> {
    vec![
        // --- Directory segments ---
        Rule::new("test-dirs", segments(&["tests", "test", "__tests__", "spec"]), "test", Some("suite"), 0.3),
        // Test file names win over any domain directory they live in.
        Rule::new("python-test-prefix", glob("test_*.py"), "test", Some("unit"), 0.3),
        Rule::new("python-test-suffix", glob("*_test.py"), "test", Some("unit"), 0.3),
        Rule::new("go-test", glob("*_test.go"), "test", Some("unit"), 0.3),
        Rule::new("js-test", glob("*.{test,spec}.{js,jsx,ts,tsx}"), "test", Some("unit"), 0.3),
        Rule::new("agent-dirs", segments(&["agents", "agent"]), "agent", None, 0.9),
        Rule::new("mcp-dirs", segments(&["mcp", "mcp_servers", "mcp-servers"]), "integration", Some("mcp"), 0.85),
        Rule::new("tool-dirs", segments(&["tools", "tool", "plugins"]), "tool", None, 0.8),
        Rule::new("workflow-dirs", segments(&["workflows", "workflow", "pipelines", "graphs", "flows"]), "workflow", None, 0.8),
        Rule::new("llm-dirs", segments(&["llm", "llms", "providers"]), "llm", None, 0.75),
        Rule::new("core-dirs", segments(&["core", "engine", "orchestrator"]), "core", None, 0.7),
        Rule::new("api-dirs", segments(&["api", "routes", "handlers", "server"]), "api", None, 0.65),
        Rule::new("prompt-dirs", segments(&["prompts", "templates"]), "prompt", None, 0.6),
        Rule::new("memory-dirs", segments(&["memory", "knowledge", "storage", "db"]), "storage", None, 0.6),
        Rule::new("script-dirs", segments(&["scripts", "bin"]), "script", None, 0.3),
        Rule::new("doc-dirs", segments(&["docs", "doc"]), "documentation", None, 0.2),
        // --- File names ---
        Rule::new(
            "build-files",
            glob("{Dockerfile,Makefile,setup.py,pyproject.toml,Cargo.toml,package.json,go.mod,*.config.js,*.config.ts}"),
            "configuration",
            Some("build"),
            0.2,
        ),
        // --- Extensions ---
        Rule::new("doc-ext", extensions(&["md", "mdx", "rst", "txt"]), "documentation", None, 0.2),
        Rule::new("config-ext", extensions(&["toml", "yaml", "yml", "json", "ini", "cfg"]), "configuration", None, 0.2),
        Rule::new(
            "source-ext",
            extensions(&["py", "rs", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "java"]),
            "source",
            None,
            0.6,
        ),
    ]
}

/// A rule with its predicate prepared for matching.
pub(crate) struct CompiledRule {
    pub(crate) rule: Rule,
    glob: Option<GlobMatcher>,
}

impl CompiledRule {
    pub(crate) fn compile(rule: Rule) -> Result<Self> {
        let glob = match &rule.predicate {
            Predicate::FileGlob(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| {
                        LoreError::config(format!("rule '{}' has invalid glob '{pattern}': {e}", rule.name))
                    })?
                    .compile_matcher(),
            ),
            _ => None,
        };
        Ok(Self { rule, glob })
    }

    /// Whether this rule applies to the root-relative, `/`-separated `path`.
    pub(crate) fn matches(&self, path: &str) -> bool {
        let (dirs, file_name) = match path.rsplit_once('/') {
            Some((dirs, name)) => (dirs, name),
            None => ("", path),
        };

        match &self.rule.predicate {
            Predicate::PathSegment(names) => dirs
                .split('/')
                .filter(|s| !s.is_empty())
                .any(|seg| names.iter().any(|n| n.eq_ignore_ascii_case(seg))),
            Predicate::FileGlob(_) => self
                .glob
                .as_ref()
                .is_some_and(|g| g.is_match(file_name)),
            Predicate::Extension(exts) => Path::new(file_name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| exts.iter().any(|x| x.eq_ignore_ascii_case(ext))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(rule: Rule) -> CompiledRule {
        CompiledRule::compile(rule).unwrap()
    }

    #[test]
    fn segment_matches_directories_only() {
        let r = compiled(Rule::new("a", segments(&["agents"]), "agent", None, 0.9));
        assert!(r.matches("src/agents/planner.py"));
        assert!(r.matches("Agents/x.py"));
        assert!(!r.matches("src/agents.py"));
        assert!(!r.matches("agents"));
    }

    #[test]
    fn glob_matches_file_name() {
        let r = compiled(Rule::new("t", glob("test_*.py"), "test", None, 0.3));
        assert!(r.matches("pkg/test_io.py"));
        assert!(r.matches("test_io.py"));
        assert!(!r.matches("test_dir/io.py"));
    }

    #[test]
    fn extension_matches_case_insensitively() {
        let r = compiled(Rule::new("d", extensions(&["md"]), "documentation", None, 0.2));
        assert!(r.matches("README.MD"));
        assert!(!r.matches("Makefile"));
    }

    #[test]
    fn invalid_glob_is_a_config_error() {
        let err = CompiledRule::compile(Rule::new("bad", glob("[unclosed"), "x", None, 0.1)).err().unwrap();
        assert!(matches!(err, LoreError::Config { .. }));
    }

    #[test]
    fn default_table_compiles() {
        for rule in default_rules() {
            assert!((0.0..=1.0).contains(&rule.weight), "{}", rule.name);
            CompiledRule::compile(rule).unwrap();
        }
    }
}
