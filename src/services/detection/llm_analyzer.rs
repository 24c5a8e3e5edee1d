// LLM Analyzer
// Generative clause classification and rationale polishing
// - LlmDetector: numbered (optionally preselected) sentences → flags
// - polish_rationales: second pass that rewrites merged rationales

use crate::models::{Flag, FlagSource};
use crate::services::providers::{ChatModel, ChatResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::detector::{DetectError, Detector};
use super::output_parser::parse_flag_output;
use super::patterns::PatternMatcher;

const DETECTION_SYSTEM_PROMPT: &str = "You are TOSCheck, a terse compliance spotter. \
Given numbered sentences from a Terms of Service or Privacy document, return compact flags \
using only the allowed categories. Cite sentences by their bracketed number. Return JSON only.";

const RETRY_REMINDER: &str = "\n\nYour previous reply was not valid JSON. Reply with the JSON list only.";

const POLISH_SYSTEM_PROMPT: &str = "You rewrite rationales for flagged Terms of Service clauses. \
Each rationale must be one plain-language sentence a consumer can understand. Return JSON only.";

fn build_detection_prompt(categories: &[&str], sentences: &[String], shown: &[usize]) -> String {
    let mut prompt = String::from("Allowed categories:\n");
    for c in categories {
        prompt.push_str(&format!("- {}\n", c));
    }
    prompt.push_str(
        "\nReturn a JSON list like:\n[{\"category\": \"<one of the above>\", \"sentence_indexes\": [<ints>], \"rationale\": \"<short reason>\"}]\n\
         Return [] when nothing is risky.\n\nSentences:\n",
    );
    for &i in shown {
        prompt.push_str(&format!("[{}] {}\n", i, sentences[i]));
    }
    prompt
}

pub(crate) async fn call_with_timeout(
    chat: &dyn ChatModel,
    system: &str,
    user: &str,
    timeout_secs: u64,
) -> Result<ChatResult, DetectError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), chat.chat(system, user)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(DetectError::Backend(e)),
        Err(_) => Err(DetectError::Timeout(timeout_secs)),
    }
}

/// Map a model-supplied category onto the catalog name, ignoring case.
fn canonical_category<'a>(matcher: &'a PatternMatcher, raw: &str) -> Option<&'a str> {
    let wanted = raw.trim().to_lowercase();
    matcher
        .category_names()
        .into_iter()
        .find(|c| c.to_lowercase() == wanted)
}

pub struct LlmDetector {
    chat: Arc<dyn ChatModel>,
    matcher: Arc<PatternMatcher>,
    preselect: bool,
    timeout_secs: u64,
    max_attempts: usize,
}

impl LlmDetector {
    pub fn new(chat: Arc<dyn ChatModel>, matcher: Arc<PatternMatcher>) -> Self {
        Self {
            chat,
            matcher,
            preselect: true,
            timeout_secs: 60,
            max_attempts: 2,
        }
    }

    pub fn with_preselect(mut self, preselect: bool) -> Self {
        self.preselect = preselect;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn clean(&self, raw: Vec<Flag>, shown: &HashSet<usize>) -> Vec<Flag> {
        raw.into_iter()
            .filter_map(|mut flag| {
                let Some(category) = canonical_category(&self.matcher, &flag.category) else {
                    warn!("[LLM_DETECTOR] dropping unknown category '{}'", flag.category);
                    return None;
                };
                flag.category = category.to_string();
                flag.sentence_indexes
                    .retain(|&i| i >= 0 && shown.contains(&(i as usize)));
                Some(flag.with_source(FlagSource::Llm))
            })
            .collect()
    }
}

#[async_trait]
impl Detector for LlmDetector {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn source(&self) -> FlagSource {
        FlagSource::Llm
    }

    async fn detect(&self, sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
        let shown: Vec<usize> = if self.preselect {
            self.matcher.select_candidate_indexes(sentences)
        } else {
            (0..sentences.len()).collect()
        };
        if shown.is_empty() {
            return Ok(vec![]);
        }

        let categories = self.matcher.category_names();
        let prompt = build_detection_prompt(&categories, sentences, &shown);
        let shown_set: HashSet<usize> = shown.iter().copied().collect();
        let mut last_err: Option<DetectError> = None;

        for attempt in 1..=self.max_attempts {
            let user = if attempt == 1 {
                prompt.clone()
            } else {
                format!("{}{}", prompt, RETRY_REMINDER)
            };

            match call_with_timeout(self.chat.as_ref(), DETECTION_SYSTEM_PROMPT, &user, self.timeout_secs).await {
                Ok(result) => match parse_flag_output(&result.content) {
                    Some(raw) => {
                        let flags = self.clean(raw, &shown_set);
                        info!(
                            "[LLM_DETECTOR] ok model={} attempt={} shown={} flags={} latency_ms={}",
                            self.chat.model_name(),
                            attempt,
                            shown.len(),
                            flags.len(),
                            result.latency_ms
                        );
                        return Ok(flags);
                    }
                    None => {
                        warn!(
                            "[LLM_DETECTOR] unparseable reply model={} attempt={} chars={}",
                            self.chat.model_name(),
                            attempt,
                            result.content.len()
                        );
                        // Malformed output is zero flags, never a failure.
                        last_err = None;
                    }
                },
                Err(e) => {
                    warn!(
                        "[LLM_DETECTOR] error model={} attempt={} : {}",
                        self.chat.model_name(),
                        attempt,
                        e
                    );
                    last_err = Some(e);
                }
            }

            if attempt < self.max_attempts {
                let backoff_ms = 400u64 * attempt as u64;
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(vec![]),
        }
    }
}

fn build_polish_prompt(sentences: &[String], flags: &[Flag]) -> String {
    let mut prompt = String::from(
        "Rewrite the rationale of each flag.\nReturn a JSON list like:\n[{\"category\": \"<same category>\", \"rationale\": \"<one sentence>\"}]\n\nFlags:\n",
    );
    for flag in flags {
        prompt.push_str(&format!("\nCategory: {}\nCurrent rationale: {}\nCited sentences:\n", flag.category, flag.rationale));
        for &i in &flag.sentence_indexes {
            if let Some(s) = usize::try_from(i).ok().and_then(|i| sentences.get(i)) {
                prompt.push_str(&format!("- {}\n", s));
            }
        }
    }
    prompt
}

/// Rationale-only copies of `flags` tagged `LlmPolish`; merge them back to apply.
///
/// Any backend or parse failure yields an empty list, leaving the originals in force.
pub async fn polish_rationales(
    chat: &dyn ChatModel,
    sentences: &[String],
    flags: &[Flag],
    timeout_secs: u64,
) -> Vec<Flag> {
    if flags.is_empty() {
        return vec![];
    }

    let prompt = build_polish_prompt(sentences, flags);
    let reply = match call_with_timeout(chat, POLISH_SYSTEM_PROMPT, &prompt, timeout_secs.max(1)).await {
        Ok(r) => r,
        Err(e) => {
            warn!("[LLM_DETECTOR] polish failed: {}", e);
            return vec![];
        }
    };

    let Some(polished) = parse_flag_output(&reply.content) else {
        warn!("[LLM_DETECTOR] polish reply unparseable");
        return vec![];
    };

    let out: Vec<Flag> = flags
        .iter()
        .filter_map(|flag| {
            let rewrite = polished
                .iter()
                .find(|p| p.category.trim().eq_ignore_ascii_case(&flag.category) && !p.rationale.is_empty())?;
            Some(
                Flag::new(flag.category.clone(), flag.sentence_indexes.clone(), rewrite.rationale.clone())
                    .with_source(FlagSource::LlmPolish),
            )
        })
        .collect();
    info!("[LLM_DETECTOR] polished flags={}/{}", out.len(), flags.len());
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::services::providers::ProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned replies in order; the last one repeats.
    pub struct ScriptedChat {
        pub replies: Mutex<Vec<Result<String, ()>>>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        pub fn new(replies: Vec<Result<&str, ()>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn chat(&self, _system: &str, user: &str) -> Result<ChatResult, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(user.to_string());
            let replies = self.replies.lock().unwrap();
            let reply = replies.get(n).or_else(|| replies.last()).cloned().unwrap_or(Err(()));
            match reply {
                Ok(content) => Ok(ChatResult { content, latency_ms: 1 }),
                Err(()) => Err(ProviderError::ApiError {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedChat;
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
    async fn test_detect_parses_and_canonicalizes() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok(
            r#"```json
[{"category": "arbitration / class-action waiver", "sentence_indexes": [2, 7], "rationale": "Forced arbitration."},
 {"category": "Vague permissions", "sentence_indexes": [1], "rationale": "?"}]
```"#,
        )]));
        let detector = LlmDetector::new(chat.clone(), matcher()).with_preselect(false);
        let flags = detector.detect(&doc()).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].category, "Arbitration / class-action waiver");
        assert_eq!(flags[0].sentence_indexes, vec![2]);
        assert_eq!(flags[0].source, Some(FlagSource::Llm));
        assert!(chat.prompts.lock().unwrap()[0].contains("[1] We do not share personal data."));
    }

    #[tokio::test]
    async fn test_malformed_output_retries_then_yields_zero_flags() {
        let chat = Arc::new(ScriptedChat::new(vec![Ok("I think clause 2 is bad."), Ok("still prose")]));
        let detector = LlmDetector::new(chat.clone(), matcher()).with_max_attempts(2);
        let flags = detector.detect(&doc()).await.unwrap();
        assert!(flags.is_empty());
        assert_eq!(chat.calls(), 2);
        assert!(chat.prompts.lock().unwrap()[1].ends_with("Reply with the JSON list only."));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates_after_attempts() {
        let chat = Arc::new(ScriptedChat::new(vec![Err(())]));
        let detector = LlmDetector::new(chat.clone(), matcher()).with_max_attempts(2);
        let err = detector.detect(&doc()).await.unwrap_err();
        assert!(matches!(err, DetectError::Backend(_)));
        assert_eq!(chat.calls(), 2);
    }

    #[tokio::test]
    async fn test_recovers_on_second_attempt() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Err(()),
            Ok(r#"[{"category":"Unilateral changes","sentence_indexes":[0],"rationale":"Can change anytime."}]"#),
        ]));
        let detector = LlmDetector::new(chat, matcher());
        let flags = detector.detect(&doc()).await.unwrap();
        assert_eq!(flags[0].sentence_indexes, vec![0]);
    }

    #[tokio::test]
    async fn test_polish_rationales() {
        let chat = ScriptedChat::new(vec![Ok(
            r#"[{"category":"Unilateral changes","rationale":"They can rewrite the deal whenever they like."}]"#,
        )]);
        let flags = vec![
            Flag::new("Unilateral changes", vec![0], "Preselected by policy pattern match."),
            Flag::new("Arbitration / class-action waiver", vec![2], "x"),
        ];
        let polished = polish_rationales(&chat, &doc(), &flags, 5).await;
        assert_eq!(polished.len(), 1);
        assert_eq!(polished[0].source, Some(FlagSource::LlmPolish));
        assert_eq!(polished[0].sentence_indexes, vec![0]);

        let failing = ScriptedChat::new(vec![Err(())]);
        assert!(polish_rationales(&failing, &doc(), &flags, 5).await.is_empty());
    }
}
