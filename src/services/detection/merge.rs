// Flag Merge Engine
// Deduplicate, union evidence and settle one rationale per category

use crate::models::{Evidence, Flag, FlagSource};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const FALLBACK_RATIONALE: &str = "Matched policy heuristics.";

struct Group {
    category: String,
    indexes: BTreeSet<usize>,
    /// (priority, rationale, source); first seen wins among equal priorities
    rationale: Option<(u8, String, Option<FlagSource>)>,
    evidence: Vec<Evidence>,
}

/// Merge raw flags from any number of detectors and windows.
///
/// Deterministic and idempotent. Indexes outside `[0, sentence_count)` and flags left with
/// no category or no index are dropped, never reported as errors.
pub fn merge_flags(sentence_count: usize, flags: Vec<Flag>) -> Vec<Flag> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Group> = HashMap::new();

    for flag in flags {
        let category = flag.category.trim();
        if category.is_empty() {
            continue;
        }
        let indexes = flag.valid_indexes(sentence_count);
        if indexes.is_empty() {
            continue;
        }

        let priority = flag.source_or_default().priority();
        let source = flag.source;
        let group = groups.entry(category.to_string()).or_insert_with(|| {
            order.push(category.to_string());
            Group {
                category: category.to_string(),
                indexes: BTreeSet::new(),
                rationale: None,
                evidence: Vec::new(),
            }
        });

        group.indexes.extend(indexes);

        let rationale = flag.rationale.trim();
        if !rationale.is_empty() {
            let replace = match &group.rationale {
                Some((current, _, _)) => priority > *current,
                None => true,
            };
            if replace {
                group.rationale = Some((priority, rationale.to_string(), source));
            }
        }

        group.evidence.extend(flag.evidence);
    }

    let mut merged: Vec<Flag> = order
        .into_iter()
        .filter_map(|cat| groups.remove(&cat))
        .map(finish_group)
        .collect();

    merged.sort_by(|a, b| {
        a.category
            .to_lowercase()
            .cmp(&b.category.to_lowercase())
            .then_with(|| a.category.cmp(&b.category))
    });
    merged
}

fn finish_group(group: Group) -> Flag {
    let (rationale, source) = match group.rationale {
        Some((_, text, source)) => (text, source),
        None => (FALLBACK_RATIONALE.to_string(), None),
    };

    // One evidence entry per sentence, best score first, cited sentences only.
    let mut best: BTreeMap<i64, Evidence> = BTreeMap::new();
    for ev in group.evidence {
        if ev.sentence_index < 0 || !group.indexes.contains(&(ev.sentence_index as usize)) {
            continue;
        }
        let keep_new = match best.get(&ev.sentence_index) {
            Some(cur) => ev.score.unwrap_or(f32::MIN) > cur.score.unwrap_or(f32::MIN),
            None => true,
        };
        if keep_new {
            best.insert(ev.sentence_index, ev);
        }
    }

    let mut flag = Flag::new(
        group.category,
        group.indexes.into_iter().map(|i| i as i64).collect(),
        rationale,
    )
    .with_evidence(best.into_values().collect());
    flag.source = source;
    flag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(cat: &str, idx: Vec<i64>, why: &str, source: FlagSource) -> Flag {
        Flag::new(cat, idx, why).with_source(source)
    }

    #[test]
    fn test_union_of_detectors() {
        let merged = merge_flags(
            10,
            vec![
                flag("Data sharing / sale", vec![1, 3], "", FlagSource::Rag),
                flag("Data sharing / sale", vec![3, 5], "", FlagSource::Heuristic),
            ],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sentence_indexes, vec![1, 3, 5]);
        assert_eq!(merged[0].rationale, FALLBACK_RATIONALE);
    }

    #[test]
    fn test_out_of_range_and_empty_dropped() {
        let merged = merge_flags(
            3,
            vec![
                flag("Unilateral changes", vec![-1, 0, 3, 99], "x", FlagSource::Llm),
                flag("", vec![0], "no category", FlagSource::Llm),
                flag("Indemnification", vec![], "no evidence", FlagSource::Llm),
                flag("Refund exclusions", vec![7], "all invalid", FlagSource::Llm),
            ],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sentence_indexes, vec![0]);
    }

    #[test]
    fn test_rationale_priority() {
        let merged = merge_flags(
            5,
            vec![
                flag("Arbitration / class-action waiver", vec![0], "rag says", FlagSource::Rag),
                flag("Arbitration / class-action waiver", vec![1], "heuristic says", FlagSource::Heuristic),
                flag("Arbitration / class-action waiver", vec![2], "llm says", FlagSource::Llm),
                flag("Arbitration / class-action waiver", vec![2], "llm later", FlagSource::Llm),
                flag("Arbitration / class-action waiver", vec![3], "  ", FlagSource::LlmPolish),
            ],
        );
        assert_eq!(merged[0].rationale, "llm says");
        assert_eq!(merged[0].source, Some(FlagSource::Llm));
        assert_eq!(merged[0].sentence_indexes, vec![0, 1, 2, 3]);

        let polished = merge_flags(
            5,
            vec![
                merged[0].clone(),
                flag("Arbitration / class-action waiver", vec![2], "plain words", FlagSource::LlmPolish),
            ],
        );
        assert_eq!(polished[0].rationale, "plain words");
    }

    #[test]
    fn test_any_non_empty_beats_fallback() {
        let merged = merge_flags(2, vec![Flag::new("Governing law / venue", vec![1], "unknown source")]);
        assert_eq!(merged[0].rationale, "unknown source");
    }

    #[test]
    fn test_sorted_case_insensitively() {
        let merged = merge_flags(
            3,
            vec![
                flag("data retention / deletion", vec![0], "", FlagSource::Rag),
                flag("Arbitration / class-action waiver", vec![1], "", FlagSource::Rag),
                flag("Children's data (COPPA / minors)", vec![2], "", FlagSource::Rag),
            ],
        );
        let cats: Vec<&str> = merged.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(
            cats,
            vec!["Arbitration / class-action waiver", "Children's data (COPPA / minors)", "data retention / deletion"]
        );
    }

    #[test]
    fn test_evidence_deduplicated_and_filtered() {
        let ev = |i: i64, s: f32| Evidence {
            sentence_index: i,
            matched_seed: Some(format!("seed{}", s)),
            score: Some(s),
        };
        let merged = merge_flags(
            4,
            vec![
                flag("Data sharing / sale", vec![1, 2], "", FlagSource::Rag).with_evidence(vec![ev(1, 0.8), ev(2, 0.9)]),
                flag("Data sharing / sale", vec![1], "", FlagSource::Rag).with_evidence(vec![ev(1, 0.95), ev(9, 0.99)]),
            ],
        );
        let evidence = &merged[0].evidence;
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].score, Some(0.95));
        assert_eq!(evidence[1].sentence_index, 2);
    }

    #[test]
    fn test_idempotent() {
        let input = vec![
            flag("Unilateral changes", vec![4, 0, 0], "", FlagSource::Heuristic),
            flag("Cookies", vec![2, -3], "tracking", FlagSource::Rag),
            flag("Unilateral changes", vec![1], "llm", FlagSource::Llm),
            Flag::new("Refund exclusions", vec![3], ""),
        ];
        let once = merge_flags(5, input);
        let twice = merge_flags(5, once.clone());
        assert_eq!(once, twice);
    }
}
