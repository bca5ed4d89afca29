//! Resolves import strings to discovered files.

use std::collections::BTreeSet;

use codelore_shared::Language;

const JS_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Root-relative paths of every known file.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    paths: BTreeSet<String>,
}

impl ModuleIndex {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The file that `import` (as written in `importer`) refers to, if it is
    /// a known file. Third-party and standard-library imports resolve to
    /// nothing.
    pub fn resolve(&self, importer: &str, language: Language, import: &str) -> Option<String> {
        let candidates = match language {
            Language::Python => python_candidates(importer, import),
            Language::JavaScript | Language::TypeScript => js_candidates(importer, import),
            Language::Rust => rust_candidates(importer, import),
            Language::Java => vec![format!("{}.java", import.replace('.', "/"))],
            _ => Vec::new(),
        };

        let suffix_allowed = matches!(language, Language::Python | Language::Java) && !import.starts_with('.');
        for candidate in &candidates {
            if self.paths.contains(candidate) {
                return Some(candidate.clone());
            }
        }
        if suffix_allowed {
            // Packages under a source dir (`src/pkg/mod.py`) import as `pkg.mod`.
            for candidate in &candidates {
                let suffix = format!("/{candidate}");
                let matches: Vec<&String> = self.paths.iter().filter(|p| p.ends_with(&suffix)).collect();
                if !matches.is_empty() {
                    return closest_to(importer, &matches);
                }
            }
        }
        None
    }
}

/// The match sharing the most leading directories with `importer`. `None`
/// when the best is tied, since the import is ambiguous.
fn closest_to(importer: &str, matches: &[&String]) -> Option<String> {
    let shared = |path: &str| {
        parent_dir(importer)
            .split('/')
            .zip(path.split('/'))
            .take_while(|(a, b)| !a.is_empty() && a == b)
            .count()
    };

    let best = matches.iter().map(|p| shared(p.as_str())).max()?;
    let mut closest = matches.iter().filter(|p| shared(p.as_str()) == best);
    match (closest.next(), closest.next()) {
        (Some(found), None) => Some((*found).clone()),
        _ => None,
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else if rest.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

/// Normalize `.` and `..` segments. `None` if the path climbs above the root.
fn normalize(path: &str) -> Option<String> {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop()?;
            }
            s => out.push(s),
        }
    }
    Some(out.join("/"))
}

fn python_candidates(importer: &str, import: &str) -> Vec<String> {
    let dots = import.chars().take_while(|c| *c == '.').count();
    let rest = import[dots..].replace('.', "/");

    let base = if dots == 0 {
        String::new()
    } else {
        let mut dir = parent_dir(importer).to_string();
        for _ in 1..dots {
            dir = parent_dir(&dir).to_string();
        }
        dir
    };

    let module = join(&base, &rest);
    if module.is_empty() {
        return vec!["__init__.py".to_string()];
    }
    vec![format!("{module}.py"), format!("{module}/__init__.py")]
}

fn js_candidates(importer: &str, import: &str) -> Vec<String> {
    if !import.starts_with("./") && !import.starts_with("../") {
        return Vec::new();
    }
    let Some(target) = normalize(&join(parent_dir(importer), import)) else {
        return Vec::new();
    };

    let mut candidates = vec![target.clone()];
    candidates.extend(JS_EXTENSIONS.iter().map(|ext| format!("{target}.{ext}")));
    candidates.extend(JS_EXTENSIONS.iter().map(|ext| format!("{target}/index.{ext}")));
    candidates
}

fn rust_candidates(importer: &str, import: &str) -> Vec<String> {
    let Some(path) = import.strip_prefix("crate::") else {
        return Vec::new();
    };
    let src_dir = match importer.find("src/") {
        Some(i) => &importer[..i + 3],
        None => return Vec::new(),
    };

    let segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty() && *s != "*").collect();
    let mut candidates = Vec::new();
    for n in (1..=segments.len()).rev() {
        let module = segments[..n].join("/");
        candidates.push(format!("{src_dir}/{module}.rs"));
        candidates.push(format!("{src_dir}/{module}/mod.rs"));
    }
    candidates
}
