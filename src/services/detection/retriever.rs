// Embedding Retriever
// Cached, L2-normalized embeddings and cosine similarity

use crate::services::embedding_cache::{text_digest, EmbeddingCache};
use crate::services::providers::{Embedder, ProviderError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const NORM_EPS: f32 = 1e-12;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding backend failed: {0}")]
    Backend(#[from] ProviderError),
    #[error("embedding backend returned {got} vectors for {expected} texts")]
    CountMismatch { expected: usize, got: usize },
    #[error("embedding has dimension {got}, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Scale to unit length; near-zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > NORM_EPS {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Inner product of two unit vectors. Empty or mismatched inputs score 0.0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Best similarity of `query` against any row of `candidates`, with the row index.
pub fn best_match(query: &[f32], candidates: &[Vec<f32>]) -> Option<(usize, f32)> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine(query, c)))
        .fold(None, |best, (i, score)| match best {
            Some((_, s)) if s >= score => best,
            _ => Some((i, score)),
        })
}

pub struct EmbeddingRetriever {
    embedder: Arc<dyn Embedder>,
    cache: Arc<dyn EmbeddingCache>,
}

impl EmbeddingRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self { embedder, cache }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or(RetrievalError::CountMismatch { expected: 1, got: 0 })
    }

    /// Unit vectors in input order; only cache misses reach the backend, in one batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let model = self.embedder.model_name().to_string();
        let digests: Vec<String> = texts.iter().map(|t| text_digest(t)).collect();

        let mut slots: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, digest) in digests.iter().enumerate() {
            let hit = match self.cache.get(&model, digest) {
                Ok(hit) => hit,
                Err(e) => {
                    warn!("[CACHE] get failed model={} err={}", model, e);
                    None
                }
            };
            if hit.is_none() {
                misses.push(i);
            }
            slots.push(hit);
        }

        if !misses.is_empty() {
            let batch: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.embedder.embed_batch(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::CountMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            for (&i, raw) in misses.iter().zip(vectors) {
                let unit = l2_normalize(raw);
                if let Err(e) = self.cache.put(&model, &digests[i], &unit) {
                    warn!("[CACHE] put failed model={} err={}", model, e);
                }
                slots[i] = Some(unit);
            }
        }

        debug!(
            "[RETRIEVER] embedded texts={} cache_hits={} model={}",
            texts.len(),
            texts.len() - misses.len(),
            model
        );

        let vectors: Vec<Vec<f32>> = slots.into_iter().map(Option::unwrap_or_default).collect();
        if let Some(first) = vectors.first() {
            if let Some(bad) = vectors.iter().find(|v| v.len() != first.len()) {
                return Err(RetrievalError::DimensionMismatch {
                    expected: first.len(),
                    got: bad.len(),
                });
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bag-of-keywords embedder: one dimension per keyword, counted case-insensitively.
    pub struct KeywordEmbedder {
        pub keywords: Vec<&'static str>,
        pub calls: AtomicUsize,
        pub texts_seen: AtomicUsize,
        pub fail: bool,
    }

    impl KeywordEmbedder {
        pub fn new(keywords: Vec<&'static str>) -> Self {
            Self {
                keywords,
                calls: AtomicUsize::new(0),
                texts_seen: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            let mut this = Self::new(vec!["x"]);
            this.fail = true;
            this
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::MissingContent);
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    let mut v: Vec<f32> = self
                        .keywords
                        .iter()
                        .map(|k| lower.matches(k).count() as f32)
                        .collect();
                    // Bias dimension keeps keyword-free texts off the zero vector.
                    v.push(0.1);
                    v
                })
                .collect())
        }

        fn model_name(&self) -> &str {
            "keyword-test"
        }
    }
}
