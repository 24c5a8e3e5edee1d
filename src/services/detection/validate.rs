// Validator
// Re-check each cited sentence against its category's own rules

use crate::models::Flag;
use tracing::debug;

use super::patterns::PatternMatcher;

/// Drop citations whose sentence does not match the flag category's patterns.
///
/// Categories without rules keep every in-range citation; flags left without citations
/// are dropped. Never adds an index.
pub fn validate_flags(sentences: &[String], flags: Vec<Flag>, matcher: &PatternMatcher) -> Vec<Flag> {
    let before = flags.len();
    let out: Vec<Flag> = flags
        .into_iter()
        .filter_map(|mut flag| {
            let category = flag.category.clone();
            flag.sentence_indexes.retain(|&i| {
                let Some(sentence) = usize::try_from(i).ok().and_then(|i| sentences.get(i)) else {
                    return false;
                };
                matcher.matches_category(&category, sentence).unwrap_or(true)
            });
            let kept: Vec<i64> = flag.sentence_indexes.clone();
            flag.evidence.retain(|e| kept.contains(&e.sentence_index));
            (!flag.sentence_indexes.is_empty()).then_some(flag)
        })
        .collect();
    debug!("[VALIDATOR] flags_in={} flags_out={}", before, out.len());
    out
}
