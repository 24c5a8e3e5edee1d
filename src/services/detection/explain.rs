// Clause Explanation
// Document chunks explained against a knowledge base of known red-flag patterns

use crate::services::providers::ChatModel;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::detector::DetectError;
use super::llm_analyzer::call_with_timeout;
use super::passage_index::{diversify_by_source, IndexError, PassageHit, PassageIndex};
use super::retriever::EmbeddingRetriever;

const EXPLAIN_SYSTEM_PROMPT: &str = "You explain Terms of Service clauses to consumers using known red-flag patterns. Be concise and concrete.";
const ANSWER_SYSTEM_PROMPT: &str = "You answer questions about a Terms of Service or Privacy document using only the provided excerpts.";
const NO_KB_MATCH: &str = "(no close KB matches)";
const LIKELY_CATEGORY: &str = "Likely category:";

#[derive(Error, Debug)]
pub enum ExplainError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Model(#[from] DetectError),
}

#[derive(Debug, Clone, Copy)]
pub struct ExplainSettings {
    /// KB passages shown per clause after diversification
    pub k_kb: usize,
    /// Candidate pool retrieved before thresholding
    pub pool: usize,
    pub kb_threshold: f32,
    pub max_per_source: usize,
    pub timeout_secs: u64,
}

impl Default for ExplainSettings {
    fn default() -> Self {
        Self {
            k_kb: 3,
            pool: 20,
            kb_threshold: 0.30,
            max_per_source: 1,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub clause_idx: usize,
    pub clause: String,
    pub patterns: Vec<PassageHit>,
    pub answer: String,
    pub likely_category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub query: String,
    pub generated_at: String,
    pub answer: String,
    pub hits: Vec<PassageHit>,
}

/// Category guess from the last `Likely category:` line of a reply.
pub fn likely_category(answer: &str) -> Option<String> {
    answer.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once(LIKELY_CATEGORY)?;
        let guess = rest.trim().trim_matches(|c| c == '*' || c == '"').trim();
        (!guess.is_empty()).then(|| guess.to_string())
    })
}

fn build_explain_prompt(clause: &str, patterns: &[PassageHit]) -> String {
    let context = if patterns.is_empty() {
        NO_KB_MATCH.to_string()
    } else {
        patterns
            .iter()
            .enumerate()
            .map(|(j, hit)| format!("[{}] {}", j, hit.chunk))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    };

    format!(
        "You are analyzing a Terms of Service clause using known red-flag patterns. \
         Explain clearly what the clause means, why it matters, and cite which patterns match.\n\n\
         Clause:\n{}\n\n\
         Relevant known patterns (from a curated KB):\n{}\n\n\
         Respond with:\n\
         - 1-2 sentence plain-language summary\n\
         - Bullet list of risks or implications with short quotes where possible\n\
         - Final line: \"{} <category guess>\"\n\
         If nothing matches, say: \"No close KB match found.\"",
        clause, context, LIKELY_CATEGORY
    )
}

/// Explain every chunk of `document` against the `kb` index.
pub async fn explain_clauses(
    chat: &dyn ChatModel,
    retriever: &EmbeddingRetriever,
    document: &PassageIndex,
    kb: &PassageIndex,
    settings: &ExplainSettings,
) -> Result<Vec<Explanation>, ExplainError> {
    info!(
        "[EXPLAIN] start clauses={} kb_chunks={} threshold={:.2}",
        document.len(),
        kb.len(),
        settings.kb_threshold
    );

    let mut explanations = Vec::with_capacity(document.len());
    for (clause_idx, clause) in document.chunks().iter().enumerate() {
        let pool = kb.retrieve(retriever, clause, settings.pool).await?;
        let strong: Vec<PassageHit> = pool
            .into_iter()
            .filter(|h| h.score >= settings.kb_threshold)
            .collect();
        let mut patterns = diversify_by_source(strong, settings.max_per_source);
        patterns.truncate(settings.k_kb);
        debug!("[EXPLAIN] clause={} patterns={}", clause_idx, patterns.len());

        let prompt = build_explain_prompt(clause, &patterns);
        let reply = call_with_timeout(chat, EXPLAIN_SYSTEM_PROMPT, &prompt, settings.timeout_secs).await?;
        let answer = reply.content.trim().to_string();

        explanations.push(Explanation {
            clause_idx,
            clause: clause.clone(),
            patterns,
            likely_category: likely_category(&answer),
            answer,
        });
    }

    info!("[EXPLAIN] done explanations={}", explanations.len());
    Ok(explanations)
}

/// Answer one question from the top `k` passages of a single index.
pub async fn answer_query(
    chat: &dyn ChatModel,
    retriever: &EmbeddingRetriever,
    index: &PassageIndex,
    query: &str,
    k: usize,
    timeout_secs: u64,
) -> Result<QueryAnswer, ExplainError> {
    let hits = index.retrieve(retriever, query, k).await?;

    let mut prompt = format!("Question: {}\n\nExcerpts:\n", query.trim());
    for hit in &hits {
        prompt.push_str(&format!("\n[{}] (score {:.3})\n{}\n", hit.idx, hit.score, hit.chunk));
    }
    prompt.push_str("\nAnswer in a few sentences and cite excerpts by their bracketed number. Say so if the excerpts do not cover the question.");

    let reply = call_with_timeout(chat, ANSWER_SYSTEM_PROMPT, &prompt, timeout_secs).await?;
    info!("[EXPLAIN] answered query hits={} latency_ms={}", hits.len(), reply.latency_ms);

    Ok(QueryAnswer {
        query: query.to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        answer: reply.content.trim().to_string(),
        hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detection::llm_analyzer::test_support::ScriptedChat;
    use crate::services::detection::passage_index::label_chunks;
    use crate::services::detection::retriever::test_support::KeywordEmbedder;
    use crate::services::embedding_cache::MemoryEmbeddingCache;
    use std::sync::Arc;

    fn retriever() -> EmbeddingRetriever {
        EmbeddingRetriever::new(
            Arc::new(KeywordEmbedder::new(vec!["arbitration", "refund", "change"])),
            Arc::new(MemoryEmbeddingCache::new()),
        )
    }

    #[test]
    fn test_likely_category() {
        assert_eq!(
            likely_category("Summary.\n- risk\nLikely category: **Arbitration**"),
            Some("Arbitration".to_string())
        );
        assert_eq!(likely_category("No close KB match found."), None);
        assert_eq!(likely_category("Likely category:   "), None);
    }

    #[tokio::test]
    async fn test_explain_clauses_thresholds_and_diversifies() {
        let retriever = retriever();
        let document = PassageIndex::build(
            &retriever,
            vec!["Disputes go to binding arbitration.".to_string(), "Hello there.".to_string()],
        )
        .await
        .unwrap();

        let mut kb_chunks = label_chunks(
            "arbitration.txt",
            vec![
                "Arbitration clauses waive court.".to_string(),
                "Arbitration also waives class actions.".to_string(),
            ],
        );
        kb_chunks.extend(label_chunks("refund.txt", vec!["No refund is given.".to_string()]));
        let kb = PassageIndex::build(&retriever, kb_chunks).await.unwrap();

        let chat = ScriptedChat::new(vec![Ok("Forced arbitration.\nLikely category: Arbitration")]);
        let explanations = explain_clauses(&chat, &retriever, &document, &kb, &ExplainSettings::default())
            .await
            .unwrap();

        assert_eq!(explanations.len(), 2);
        assert_eq!(explanations[0].patterns.len(), 1);
        assert!(explanations[0].patterns[0].chunk.starts_with("### FILE: arbitration.txt"));
        assert_eq!(explanations[0].likely_category.as_deref(), Some("Arbitration"));
        assert!(explanations[1].patterns.is_empty());

        let prompts = chat.prompts.lock().unwrap();
        assert!(!prompts[0].contains(NO_KB_MATCH));
        assert!(prompts[1].contains(NO_KB_MATCH));
    }

    #[tokio::test]
    async fn test_explain_propagates_backend_failure() {
        let retriever = retriever();
        let document = PassageIndex::build(&retriever, vec!["We may change the terms.".to_string()])
            .await
            .unwrap();
        let kb = PassageIndex::default();
        let chat = ScriptedChat::new(vec![Err(())]);
        let err = explain_clauses(&chat, &retriever, &document, &kb, &ExplainSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExplainError::Model(DetectError::Backend(_))));
    }

    #[tokio::test]
    async fn test_answer_query_uses_top_hits() {
        let retriever = retriever();
        let index = PassageIndex::build(
            &retriever,
            vec![
                "We may change these terms.".to_string(),
                "Refund requests are refused after 14 days.".to_string(),
                "Hello there.".to_string(),
            ],
        )
        .await
        .unwrap();

        let chat = ScriptedChat::new(vec![Ok("  Refunds end after 14 days [1].  ")]);
        let answer = answer_query(&chat, &retriever, &index, "Can I get a refund?", 2, 5)
            .await
            .unwrap();

        assert_eq!(answer.answer, "Refunds end after 14 days [1].");
        assert_eq!(answer.hits.len(), 2);
        assert_eq!(answer.hits[0].idx, 1);
        assert!(chat.prompts.lock().unwrap()[0].contains("[1] (score"));
    }
}
