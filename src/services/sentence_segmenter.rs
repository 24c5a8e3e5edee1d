// Sentence Segmenter Service Client
// Calls an optional sentence-boundary HTTP service, falls back to the lexical splitter

use crate::services::text_processor::split_sentences;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceResult {
    pub text: String,
    #[serde(default)]
    pub start: i32,
    #[serde(default)]
    pub end: i32,
}

#[derive(Debug, Serialize)]
struct SegmentRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    sentences: Vec<SentenceResult>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Which splitter produced a sentence sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterBackend {
    Service,
    Lexical,
}

pub struct TextSegmenterClient {
    base_url: String,
}

impl TextSegmenterClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match get_client().get(&url).send().await {
            Ok(resp) => match resp.json::<HealthResponse>().await {
                Ok(health) => health.status == "ok",
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub async fn segment_sentences(&self, text: &str, language: &str) -> Result<Vec<SentenceResult>, String> {
        let url = format!("{}/segment", self.base_url);
        let request = SegmentRequest { text, language };

        let response = get_client()
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("Failed to call segmenter service: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("Segmenter service returned error: {}", response.status()));
        }

        let result: SegmentResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse response: {}", e))?;

        Ok(result.sentences)
    }
}

/// Trim, collapse whitespace and drop empty service sentences
fn clean_service_sentences(raw: Vec<SentenceResult>) -> Vec<String> {
    raw.into_iter()
        .map(|s| s.text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Segment with the service when one is configured, otherwise (or on any failure) lexically.
///
/// Never fails: empty text yields an empty sequence.
pub async fn segment_document(text: &str, service_url: Option<&str>) -> (Vec<String>, SegmenterBackend) {
    if text.trim().is_empty() {
        return (vec![], SegmenterBackend::Lexical);
    }

    if let Some(url) = service_url.map(str::trim).filter(|u| !u.is_empty()) {
        let client = TextSegmenterClient::new(url);
        if !client.is_available().await {
            warn!("[SEGMENTER] service at {} not healthy, falling back to lexical", url);
            let sentences = split_sentences(text);
            info!("[SEGMENTER] lexical sentences={}", sentences.len());
            return (sentences, SegmenterBackend::Lexical);
        }
        match client.segment_sentences(text, "en").await {
            Ok(raw) => {
                let sentences = clean_service_sentences(raw);
                if !sentences.is_empty() {
                    info!("[SEGMENTER] service ok sentences={}", sentences.len());
                    return (sentences, SegmenterBackend::Service);
                }
                warn!("[SEGMENTER] service returned no sentences, falling back to lexical");
            }
            Err(e) => {
                warn!("[SEGMENTER] service unavailable ({}), falling back to lexical", e);
            }
        }
    }

    let sentences = split_sentences(text);
    info!("[SEGMENTER] lexical sentences={}", sentences.len());
    (sentences, SegmenterBackend::Lexical)
}
