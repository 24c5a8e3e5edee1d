// Heuristic Detector
// Pattern-match every sentence, keep the strongest suspects

use crate::models::{Flag, FlagSource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::detector::{DetectError, Detector};
use super::patterns::PatternMatcher;

pub const HEURISTIC_RATIONALE: &str = "Preselected by policy pattern match.";

/// Indexes of sentences that hit at least one rule, strongest first (ties by index),
/// capped at `max_suspects`.
pub fn rank_suspects(matcher: &PatternMatcher, sentences: &[String], max_suspects: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, usize)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (i, matcher.hit_count(s)))
        .filter(|(_, hits)| *hits > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(max_suspects);
    scored.into_iter().map(|(i, _)| i).collect()
}

pub struct HeuristicDetector {
    matcher: Arc<PatternMatcher>,
    max_suspects: usize,
}

impl HeuristicDetector {
    pub fn new(matcher: Arc<PatternMatcher>, max_suspects: usize) -> Self {
        Self { matcher, max_suspects }
    }

    /// One flag per category, citing every suspect sentence that hits it.
    pub fn flag_sentences(&self, sentences: &[String]) -> Vec<Flag> {
        let mut suspects = rank_suspects(&self.matcher, sentences, self.max_suspects);
        suspects.sort_unstable();

        let mut by_category: BTreeMap<usize, (String, Vec<i64>)> = BTreeMap::new();
        let order = self.matcher.category_names();
        for idx in suspects {
            for category in self.matcher.match_sentence(&sentences[idx]) {
                let rank = order.iter().position(|c| *c == category).unwrap_or(usize::MAX);
                by_category
                    .entry(rank)
                    .or_insert_with(|| (category.to_string(), Vec::new()))
                    .1
                    .push(idx as i64);
            }
        }

        by_category
            .into_values()
            .map(|(category, indexes)| {
                Flag::new(category, indexes, HEURISTIC_RATIONALE).with_source(FlagSource::Heuristic)
            })
            .collect()
    }
}

#[async_trait]
impl Detector for HeuristicDetector {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn source(&self) -> FlagSource {
        FlagSource::Heuristic
    }

    async fn detect(&self, sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
        let flags = self.flag_sentences(sentences);
        debug!("[HEURISTIC] sentences={} flags={}", sentences.len(), flags.len());
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Vec<String> {
        vec![
            "We may change these terms at any time without notice.".to_string(),
            "We do not share personal data.".to_string(),
            "Disputes go to binding arbitration.".to_string(),
        ]
    }

    fn matcher() -> Arc<PatternMatcher> {
        let raw = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/category_rules.json"));
        Arc::new(PatternMatcher::from_json(raw).unwrap())
    }

    #[tokio::test]
    async fn test_detect_flags_risky_sentences() {
        let detector = HeuristicDetector::new(matcher(), 120);
        let flags = detector.detect(&doc()).await.unwrap();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].category, "Arbitration / class-action waiver");
        assert_eq!(flags[0].sentence_indexes, vec![2]);
        assert_eq!(flags[1].category, "Unilateral changes");
        assert_eq!(flags[1].sentence_indexes, vec![0]);
        assert!(flags.iter().all(|f| f.source == Some(FlagSource::Heuristic)));
    }

    #[test]
    fn test_rank_suspects_orders_by_hits_then_index() {
        let m = matcher();
        let s = vec![
            "Disputes go to binding arbitration.".to_string(),
            "Nothing to see.".to_string(),
            "Binding arbitration and no class action, and you waive any jury trial.".to_string(),
            "Any dispute goes to arbitration.".to_string(),
        ];
        assert!(m.hit_count(&s[2]) > m.hit_count(&s[0]));
        assert_eq!(m.hit_count(&s[0]), m.hit_count(&s[3]));
        assert_eq!(rank_suspects(&m, &s, 10), vec![2, 0, 3]);
        assert_eq!(rank_suspects(&m, &s, 1), vec![2]);
        assert!(rank_suspects(&m, &s, 0).is_empty());
    }
}
