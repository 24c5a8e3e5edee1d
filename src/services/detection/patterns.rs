// Pattern Matcher
// Category → case-insensitive regex rules, loaded from data rather than code

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Sentences handed to the generative detector when nothing matches
pub const FALLBACK_CANDIDATES: usize = 12;

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid rule file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pattern for category '{category}': {source}")]
    Regex {
        category: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule file has an empty category name")]
    EmptyCategory,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    version: String,
    categories: Vec<RulesCategory>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RulesCategory {
    name: String,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Clone)]
struct CategoryRules {
    name: String,
    patterns: Vec<Regex>,
}

/// The closed, ordered category set with its lexical signatures.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    version: String,
    categories: Vec<CategoryRules>,
    keywords: Vec<Regex>,
}

fn compile(pattern: &str, category: &str) -> Result<Regex, PatternError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| PatternError::Regex {
            category: category.to_string(),
            source,
        })
}

static BUILTIN: OnceLock<PatternMatcher> = OnceLock::new();

impl PatternMatcher {
    pub fn from_json(raw: &str) -> Result<Self, PatternError> {
        let parsed: RulesFile = serde_json::from_str(raw)?;

        let mut categories = Vec::with_capacity(parsed.categories.len());
        for entry in parsed.categories {
            let name = entry.name.trim().to_string();
            if name.is_empty() {
                return Err(PatternError::EmptyCategory);
            }
            let patterns = entry
                .patterns
                .iter()
                .map(|p| compile(p, &name))
                .collect::<Result<Vec<_>, _>>()?;
            categories.push(CategoryRules { name, patterns });
        }

        let keywords = parsed
            .keywords
            .iter()
            .map(|p| compile(p, "keywords"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: parsed.version,
            categories,
            keywords,
        })
    }

    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PatternError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Rules shipped in `data/category_rules.json`
    pub fn builtin() -> &'static PatternMatcher {
        BUILTIN.get_or_init(|| {
            let raw = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/category_rules.json"));
            PatternMatcher::from_json(raw).expect("data/category_rules.json must be valid")
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn category_names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_known(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.name == category)
    }

    /// Categories hit by a sentence, in catalog order.
    pub fn match_sentence(&self, sentence: &str) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|c| c.patterns.iter().any(|re| re.is_match(sentence)))
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Number of individual rules a sentence hits across all categories.
    pub fn hit_count(&self, sentence: &str) -> usize {
        self.categories
            .iter()
            .flat_map(|c| c.patterns.iter())
            .filter(|re| re.is_match(sentence))
            .count()
    }

    /// `None` when the category has no rules (unknown or empty rule list).
    pub fn matches_category(&self, category: &str, sentence: &str) -> Option<bool> {
        let rules = self.categories.iter().find(|c| c.name == category)?;
        if rules.patterns.is_empty() {
            return None;
        }
        Some(rules.patterns.iter().any(|re| re.is_match(sentence)))
    }

    /// Indexes of sentences containing any prefilter keyword.
    pub fn keyword_filter(&self, sentences: &[String]) -> Vec<usize> {
        sentences
            .iter()
            .enumerate()
            .filter(|(_, s)| self.keywords.iter().any(|re| re.is_match(s)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Pattern or keyword hits plus their immediate neighbours, ascending.
    ///
    /// Falls back to the first few sentences so the generative detector always sees something.
    pub fn select_candidate_indexes(&self, sentences: &[String]) -> Vec<usize> {
        let n = sentences.len();
        let mut picked = BTreeSet::new();
        for (i, s) in sentences.iter().enumerate() {
            let hit = !self.match_sentence(s).is_empty() || self.keywords.iter().any(|re| re.is_match(s));
            if !hit {
                continue;
            }
            picked.insert(i.saturating_sub(1));
            picked.insert(i);
            if i + 1 < n {
                picked.insert(i + 1);
            }
        }

        if picked.is_empty() {
            return (0..n.min(FALLBACK_CANDIDATES)).collect();
        }
        picked.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_builtin_rules_load() {
        let matcher = PatternMatcher::builtin();
        let names = matcher.category_names();
        assert_eq!(names.len(), 22);
        assert_eq!(names[0], "Arbitration / class-action waiver");
        assert!(matcher.is_known("Unilateral changes"));
        assert!(!matcher.is_known("Made up"));
    }

    #[test]
    fn test_match_sentence_is_case_insensitive() {
        let matcher = PatternMatcher::builtin();
        let hits = matcher.match_sentence("DISPUTES GO TO BINDING ARBITRATION.");
        assert_eq!(hits, vec!["Arbitration / class-action waiver"]);
        assert!(matcher.match_sentence("We do not share personal data.").is_empty());
    }

    #[test]
    fn test_matches_category() {
        let matcher = PatternMatcher::builtin();
        let s = "We may change these terms at any time without notice.";
        assert_eq!(matcher.matches_category("Unilateral changes", s), Some(true));
        assert_eq!(matcher.matches_category("Indemnification", s), Some(false));
        assert_eq!(matcher.matches_category("Not a category", s), None);
    }

    #[test]
    fn test_custom_rules_and_errors() {
        let raw = r#"{"categories":[{"name":"Cats","patterns":["\\bcat\\b"]},{"name":"Open","patterns":[]}]}"#;
        let matcher = PatternMatcher::from_json(raw).unwrap();
        assert_eq!(matcher.match_sentence("A Cat sat."), vec!["Cats"]);
        assert_eq!(matcher.matches_category("Open", "anything"), None);

        let bad = r#"{"categories":[{"name":"Bad","patterns":["("]}]}"#;
        assert!(matches!(PatternMatcher::from_json(bad), Err(PatternError::Regex { .. })));
        let empty = r#"{"categories":[{"name":"  ","patterns":[]}]}"#;
        assert!(matches!(PatternMatcher::from_json(empty), Err(PatternError::EmptyCategory)));
    }

    #[test]
    fn test_select_candidates_includes_neighbours() {
        let matcher = PatternMatcher::builtin();
        let s = sentences(&[
            "Welcome.",
            "Hello there.",
            "Disputes go to binding arbitration.",
            "Thanks.",
            "Bye.",
        ]);
        assert_eq!(matcher.select_candidate_indexes(&s), vec![1, 2, 3]);
    }

    #[test]
    fn test_select_candidates_fallback() {
        let matcher = PatternMatcher::builtin();
        let s: Vec<String> = (0..20).map(|i| format!("Plain sentence {}.", i)).collect();
        assert_eq!(matcher.select_candidate_indexes(&s), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_keyword_filter() {
        let matcher = PatternMatcher::builtin();
        let s = sentences(&["You waive any jury trial.", "Nothing here."]);
        assert_eq!(matcher.keyword_filter(&s), vec![0]);
    }
}
