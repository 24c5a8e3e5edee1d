// Passage Index
// Persisted (chunk, vector) pairs for knowledge-base retrieval

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use super::retriever::{cosine, EmbeddingRetriever, RetrievalError};

pub const CHUNKS_FILE: &str = "chunks.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.json";
pub const SOURCE_MARKER: &str = "### FILE:";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("index JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("index artifacts are misaligned: {chunks} chunks vs {vectors} vectors")]
    Misaligned { chunks: usize, vectors: usize },
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageHit {
    pub idx: usize,
    pub score: f32,
    pub chunk: String,
}

#[derive(Debug, Clone, Default)]
pub struct PassageIndex {
    chunks: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl PassageIndex {
    pub fn new(chunks: Vec<String>, vectors: Vec<Vec<f32>>) -> Result<Self, IndexError> {
        if chunks.len() != vectors.len() {
            return Err(IndexError::Misaligned {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        Ok(Self { chunks, vectors })
    }

    pub async fn build(retriever: &EmbeddingRetriever, chunks: Vec<String>) -> Result<Self, IndexError> {
        let vectors = retriever.embed_batch(&chunks).await?;
        info!("[INDEX] built chunks={} model={}", chunks.len(), retriever.model_name());
        Self::new(chunks, vectors)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let chunks_path = dir.join(CHUNKS_FILE);
        let vectors_path = dir.join(EMBEDDINGS_FILE);
        fs::write(&chunks_path, serde_json::to_vec_pretty(&self.chunks)?).map_err(io_err(&chunks_path))?;
        fs::write(&vectors_path, serde_json::to_vec(&self.vectors)?).map_err(io_err(&vectors_path))?;
        info!("[INDEX] saved chunks={} dir={}", self.chunks.len(), dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let chunks_path = dir.join(CHUNKS_FILE);
        let vectors_path = dir.join(EMBEDDINGS_FILE);
        let chunks: Vec<String> =
            serde_json::from_str(&fs::read_to_string(&chunks_path).map_err(io_err(&chunks_path))?)?;
        let vectors: Vec<Vec<f32>> =
            serde_json::from_str(&fs::read_to_string(&vectors_path).map_err(io_err(&vectors_path))?)?;
        Self::new(chunks, vectors)
    }

    /// Top `k` chunks by similarity to a unit query vector; ties keep index order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<PassageHit> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(k)
            .map(|(idx, score)| PassageHit {
                idx,
                score,
                chunk: self.chunks[idx].clone(),
            })
            .collect()
    }

    pub async fn retrieve(
        &self,
        retriever: &EmbeddingRetriever,
        query: &str,
        k: usize,
    ) -> Result<Vec<PassageHit>, IndexError> {
        let qv = retriever.embed(query).await?;
        Ok(self.search(&qv, k))
    }
}

/// Prefix every chunk of one knowledge-base file with its source marker line.
pub fn label_chunks(source: &str, chunks: Vec<String>) -> Vec<String> {
    chunks
        .into_iter()
        .map(|c| format!("{} {}\n{}", SOURCE_MARKER, source, c))
        .collect()
}

/// Source name from a `### FILE: name` first line.
pub fn source_label(chunk: &str) -> Option<&str> {
    let first = chunk.lines().next()?;
    let name = first.trim().strip_prefix(SOURCE_MARKER)?.trim();
    (!name.is_empty()).then_some(name)
}

/// Keep at most `max_per_source` best hits per source, then re-sort by score.
///
/// Chunks without a marker count as their own source.
pub fn diversify_by_source(hits: Vec<PassageHit>, max_per_source: usize) -> Vec<PassageHit> {
    let mut kept_per_source: HashMap<String, usize> = HashMap::new();
    let mut sorted = hits;
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.idx.cmp(&b.idx)));

    sorted
        .into_iter()
        .filter(|hit| {
            let key = match source_label(&hit.chunk) {
                Some(name) => name.to_string(),
                None => format!("#{}", hit.idx),
            };
            let kept = kept_per_source.entry(key).or_insert(0);
            if *kept >= max_per_source {
                return false;
            }
            *kept += 1;
            true
        })
        .collect()
}
