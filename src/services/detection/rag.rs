// Semantic (RAG-seed) Detector
// Flags sentences whose best similarity to a category's exemplar seeds clears a threshold

use crate::models::{Evidence, Flag, FlagSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::detector::{DetectError, Detector};
use super::retriever::{best_match, EmbeddingRetriever};

/// Category → exemplar sentences.
#[derive(Debug, Clone, Default)]
pub struct SeedSet {
    categories: Vec<(String, Vec<String>)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Map(serde_json::Map<String, serde_json::Value>),
    List(Vec<SeedEntry>),
}

#[derive(Deserialize)]
struct SeedEntry {
    category: String,
    #[serde(default)]
    seeds: Vec<String>,
}

impl SeedSet {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let parsed: SeedFile = serde_json::from_str(raw).map_err(|e| format!("Failed to parse seeds: {}", e))?;
        let pairs: Vec<(String, Vec<String>)> = match parsed {
            SeedFile::Map(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let seeds = v
                        .as_array()
                        .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                    (k, seeds)
                })
                .collect(),
            SeedFile::List(list) => list.into_iter().map(|e| (e.category, e.seeds)).collect(),
        };

        let categories = pairs
            .into_iter()
            .map(|(cat, seeds)| {
                let seeds: Vec<String> = seeds
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                (cat.trim().to_string(), seeds)
            })
            .filter(|(cat, seeds)| !cat.is_empty() && !seeds.is_empty())
            .collect();
        Ok(Self { categories })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read seeds {}: {}", path.display(), e))?;
        Self::from_json(&raw)
    }

    /// Seeds shipped in `data/seeds.json`
    pub fn builtin() -> Self {
        let raw = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/seeds.json"));
        Self::from_json(raw).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(c, _)| c.as_str())
    }
}

struct EmbeddedSeeds {
    /// (category, seed texts, unit vectors)
    categories: Vec<(String, Vec<String>, Vec<Vec<f32>>)>,
}

pub struct RagDetector {
    retriever: Arc<EmbeddingRetriever>,
    seeds: SeedSet,
    threshold: f32,
    embedded: OnceCell<EmbeddedSeeds>,
}

impl RagDetector {
    pub fn new(retriever: Arc<EmbeddingRetriever>, seeds: SeedSet, threshold: f32) -> Self {
        Self {
            retriever,
            seeds,
            threshold: threshold.clamp(0.0, 1.0),
            embedded: OnceCell::new(),
        }
    }

    async fn embedded_seeds(&self) -> Result<&EmbeddedSeeds, DetectError> {
        self.embedded
            .get_or_try_init(|| async {
                let mut categories = Vec::with_capacity(self.seeds.categories.len());
                for (category, texts) in &self.seeds.categories {
                    let vectors = self.retriever.embed_batch(texts).await?;
                    categories.push((category.clone(), texts.clone(), vectors));
                }
                info!(
                    "[RAG] seeds embedded categories={} model={}",
                    categories.len(),
                    self.retriever.model_name()
                );
                Ok::<_, DetectError>(EmbeddedSeeds { categories })
            })
            .await
    }
}

#[async_trait]
impl Detector for RagDetector {
    fn name(&self) -> &'static str {
        "rag"
    }

    fn source(&self) -> FlagSource {
        FlagSource::Rag
    }

    async fn detect(&self, sentences: &[String]) -> Result<Vec<Flag>, DetectError> {
        if sentences.is_empty() || self.seeds.is_empty() {
            return Ok(vec![]);
        }

        let seeds = self.embedded_seeds().await?;
        let vectors = self.retriever.embed_batch(sentences).await?;

        // Keyed by seed position so output order follows the seed set.
        let mut hits: BTreeMap<usize, (Vec<i64>, Vec<Evidence>, f32)> = BTreeMap::new();
        for (sent_idx, vector) in vectors.iter().enumerate() {
            for (cat_idx, (_, texts, seed_vecs)) in seeds.categories.iter().enumerate() {
                let Some((seed_idx, score)) = best_match(vector, seed_vecs) else {
                    continue;
                };
                if score < self.threshold {
                    continue;
                }
                let entry = hits.entry(cat_idx).or_insert_with(|| (Vec::new(), Vec::new(), f32::MIN));
                entry.0.push(sent_idx as i64);
                entry.1.push(Evidence {
                    sentence_index: sent_idx as i64,
                    matched_seed: Some(texts[seed_idx].clone()),
                    score: Some(score),
                });
                entry.2 = entry.2.max(score);
            }
        }

        let flags: Vec<Flag> = hits
            .into_iter()
            .map(|(cat_idx, (indexes, evidence, best))| {
                let category = seeds.categories[cat_idx].0.clone();
                let rationale = format!("Semantically similar to known {} clauses (max score {:.2}).", category, best);
                Flag::new(category, indexes, rationale)
                    .with_source(FlagSource::Rag)
                    .with_evidence(evidence)
            })
            .collect();

        debug!(
            "[RAG] sentences={} flags={} threshold={:.2}",
            sentences.len(),
            flags.len(),
            self.threshold
        );
        Ok(flags)
    }
}
