// AI Provider Service
// OpenAI-compatible chat and embedding calls (Ollama, vLLM, OpenAI, ...)

use crate::services::config_store::{AppConfig, ProviderSettings};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Key sent when nothing is configured; local OpenAI-compatible servers ignore it.
const FALLBACK_API_KEY: &str = "ollama";

const MAX_TOKENS: i32 = 1024;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured")]
    MissingApiKey,
}

/// Generative model collaborator: one system + user turn in, text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<ChatResult, ProviderError>;

    fn model_name(&self) -> &str;
}

/// Embedding model collaborator. Vectors come back in input order, not normalized.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: i32,
    temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
}

pub struct ProviderClient {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embed_model: String,
}

impl ProviderClient {
    pub fn new(settings: &ProviderSettings, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: settings.chat_model.clone(),
            embed_model: settings.embed_model.clone(),
        }
    }

    /// Build from a loaded config: provider settings with env overrides, key from env then
    /// `config.api_keys`, then the local-server placeholder.
    pub fn from_config(config: &AppConfig) -> Self {
        let settings = config.provider.clone().with_env_overrides();
        let key = get_api_key("openai", &config.api_keys).unwrap_or_else(|| FALLBACK_API_KEY.to_string());
        Self::new(&settings, key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call_chat_api(&self, system: &str, user: &str) -> Result<ChatResult, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user.to_string(),
        });

        let request = ChatRequest {
            model: self.chat_model.clone(),
            messages,
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .ok_or(ProviderError::MissingContent)?;

        debug!(
            "[PROVIDER] chat ok model={} latency_ms={} chars={}",
            self.chat_model,
            latency_ms,
            content.len()
        );

        Ok(ChatResult { content, latency_ms })
    }

    async fn call_embeddings_api(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.embed_model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        order_embeddings(data.data, texts.len())
    }
}

/// Put embedding items back in request order and check the count.
fn order_embeddings(mut items: Vec<EmbeddingItem>, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    if items.len() != expected {
        return Err(ProviderError::JsonError(format!(
            "expected {} embeddings, got {}",
            expected,
            items.len()
        )));
    }
    if items.iter().all(|it| it.index.is_some()) {
        items.sort_by_key(|it| it.index.unwrap_or(0));
    }
    Ok(items.into_iter().map(|it| it.embedding).collect())
}

#[async_trait]
impl ChatModel for ProviderClient {
    async fn chat(&self, system: &str, user: &str) -> Result<ChatResult, ProviderError> {
        self.call_chat_api(system, user).await
    }

    fn model_name(&self) -> &str {
        &self.chat_model
    }
}

#[async_trait]
impl Embedder for ProviderClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.call_embeddings_api(texts).await
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }
}

/// API key for `provider`: `TOSCHECK_API_KEY` / `OPENAI_API_KEY`, then the config's `apiKeys`.
pub fn get_api_key(provider: &str, api_keys: &HashMap<String, String>) -> Option<String> {
    lookup_api_key(provider, api_keys, |name| env::var(name).ok())
}

fn lookup_api_key(
    provider: &str,
    api_keys: &HashMap<String, String>,
    env_var: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let env_keys: &[&str] = match provider {
        "openai" => &["TOSCHECK_API_KEY", "OPENAI_API_KEY"],
        _ => &["TOSCHECK_API_KEY"],
    };

    env_keys
        .iter()
        .filter_map(|name| env_var(name))
        .chain(api_keys.get(provider).cloned())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}
