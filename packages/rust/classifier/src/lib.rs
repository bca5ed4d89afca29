//! File classification: category, importance and tags per scan result.

pub mod rules;

use std::collections::BTreeMap;

use tracing::debug;

use codelore_shared::{Classification, ClassifiedResult, ClassifyConfig, Result, ScanResult};

use rules::{CompiledRule, Rule, UTILITY_CATEGORY, UTILITY_WEIGHT, default_rules};

const SCORE_SHARE: f64 = 0.6;
const CATEGORY_SHARE: f64 = 0.4;

/// Evaluates an ordered rule table against scan results.
pub struct Classifier {
    rules: Vec<CompiledRule>,
    config: ClassifyConfig,
}

impl Classifier {
    /// Classifier with the built-in rule table.
    pub fn new(config: ClassifyConfig) -> Result<Self> {
        Self::with_rules(config, default_rules())
    }

    /// Classifier with a caller-supplied table, evaluated in the given order.
    pub fn with_rules(config: ClassifyConfig, rules: Vec<Rule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, config })
    }

    /// One classification per input, in input order.
    pub fn classify(&self, results: &[ScanResult]) -> Vec<Classification> {
        results.iter().map(|r| self.classify_one(r)).collect()
    }

    /// Classify and pair each result with its classification.
    pub fn classify_all(&self, results: Vec<ScanResult>) -> Vec<ClassifiedResult> {
        results
            .into_iter()
            .map(|scan| {
                let classification = self.classify_one(&scan);
                ClassifiedResult {
                    scan,
                    classification,
                }
            })
            .collect()
    }

    pub fn classify_one(&self, result: &ScanResult) -> Classification {
        let path = result.file.path.as_str();
        let matched = self.rules.iter().find(|r| r.matches(path)).map(|r| &r.rule);

        let (category, subcategory, weight) = match matched {
            Some(rule) => (rule.category.clone(), rule.subcategory.clone(), rule.weight),
            None => (UTILITY_CATEGORY.to_string(), None, UTILITY_WEIGHT),
        };

        let mut importance = importance(result.file.score, weight);
        if matched.is_none() {
            importance = importance.max(self.config.baseline_importance);
        }

        debug!(
            path,
            rule = matched.map(|r| r.name.as_str()).unwrap_or(UTILITY_CATEGORY),
            importance,
            "classified"
        );

        Classification {
            path: result.file.path.clone(),
            category,
            subcategory,
            importance,
            tags: tags(result, self.config.max_tags),
        }
    }
}

/// Importance in `[0, 10]` from relevance score and category weight.
pub fn importance(score: f64, category_weight: f64) -> f64 {
    let raw = SCORE_SHARE * score.clamp(0.0, 1.0) + CATEGORY_SHARE * category_weight.clamp(0.0, 1.0);
    (raw * 10.0).clamp(0.0, 10.0)
}

/// Distinct pattern types ordered by their best confidence (then name),
/// capped at `max_tags`.
fn tags(result: &ScanResult, max_tags: usize) -> Vec<String> {
    let mut best: BTreeMap<&str, f64> = BTreeMap::new();
    for p in &result.patterns {
        let entry = best.entry(p.pattern_type.as_str()).or_insert(p.confidence);
        if p.confidence > *entry {
            *entry = p.confidence;
        }
    }

    let mut ranked: Vec<(&str, f64)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(max_tags)
        .map(|(t, _)| t.to_string())
        .collect()
}
