// Flag Pipeline
// text → sentences → windowed detectors → combine → merge → validate → (polish) → report

use crate::models::{CombineMode, Flag, FlagSource, ScanEngine, ScanReport, SourceStatus};
use crate::services::config_store::ScanConfig;
use crate::services::providers::ChatModel;
use crate::services::sentence_segmenter::segment_document;
use crate::services::text_processor::normalize_text;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::detector::Detector;
use super::heuristic::HeuristicDetector;
use super::llm_analyzer::{polish_rationales, LlmDetector};
use super::merge::merge_flags;
use super::patterns::PatternMatcher;
use super::rag::{RagDetector, SeedSet};
use super::retriever::EmbeddingRetriever;
use super::validate::validate_flags;
use super::window_scanner::{scan_windows, WindowSettings, WindowedScan};

/// Sentences plus the report that cites them.
#[derive(Debug, Clone)]
pub struct DocumentScan {
    pub sentences: Vec<String>,
    pub report: ScanReport,
}

pub struct FlagPipeline {
    config: ScanConfig,
    matcher: Arc<PatternMatcher>,
    seeds: SeedSet,
    chat: Option<Arc<dyn ChatModel>>,
    retriever: Option<Arc<EmbeddingRetriever>>,
    segmenter_url: Option<String>,
}

impl FlagPipeline {
    pub fn new(config: ScanConfig, matcher: Arc<PatternMatcher>) -> Self {
        Self {
            config,
            matcher,
            seeds: SeedSet::builtin(),
            chat: None,
            retriever: None,
            segmenter_url: None,
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<EmbeddingRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_seeds(mut self, seeds: SeedSet) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_segmenter_url(mut self, url: Option<String>) -> Self {
        self.segmenter_url = url;
        self
    }

    fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            window_size: self.config.window_size,
            overlap: self.config.overlap,
            max_concurrency: self.config.max_concurrency,
        }
    }

    fn heuristic(&self) -> Arc<dyn Detector> {
        Arc::new(HeuristicDetector::new(Arc::clone(&self.matcher), self.config.max_suspects))
    }

    fn rag(&self) -> Option<Arc<dyn Detector>> {
        let retriever = self.retriever.as_ref()?;
        Some(Arc::new(RagDetector::new(
            Arc::clone(retriever),
            self.seeds.clone(),
            self.config.similarity_threshold,
        )))
    }

    fn llm(&self) -> Option<Arc<dyn Detector>> {
        let chat = self.chat.as_ref()?;
        Some(Arc::new(
            LlmDetector::new(Arc::clone(chat), Arc::clone(&self.matcher))
                .with_preselect(self.config.preselect)
                .with_timeout(self.config.llm_timeout_secs)
                .with_max_attempts(self.config.llm_max_attempts),
        ))
    }

    /// Detectors for the configured engine plus statuses for the ones that could not be built.
    pub fn detectors(&self) -> (Vec<Arc<dyn Detector>>, Vec<SourceStatus>) {
        let missing = |name: &str, what: &str| SourceStatus {
            detector: name.to_string(),
            windows_ok: 0,
            windows_failed: 0,
            last_error: Some(format!("{} not configured", what)),
        };

        let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
        let mut unavailable = Vec::new();
        let engine = self.config.engine;

        if engine == ScanEngine::Heuristics || engine == ScanEngine::Hybrid {
            detectors.push(self.heuristic());
        }
        if engine == ScanEngine::Rag || engine == ScanEngine::Hybrid {
            match self.rag() {
                Some(d) => detectors.push(d),
                None => unavailable.push(missing("rag", "embedding backend")),
            }
        }
        if engine == ScanEngine::Llm || engine == ScanEngine::Hybrid {
            match self.llm() {
                Some(d) => detectors.push(d),
                None => unavailable.push(missing("llm", "chat model")),
            }
        }
        (detectors, unavailable)
    }

    /// Normalize, segment and scan raw document text.
    pub async fn scan_text(&self, text: &str) -> DocumentScan {
        let normalized = normalize_text(text);
        let (sentences, backend) = segment_document(&normalized, self.segmenter_url.as_deref()).await;
        info!("[PIPELINE] segmented sentences={} backend={:?}", sentences.len(), backend);
        let report = self.scan_sentences(sentences.clone()).await;
        DocumentScan { sentences, report }
    }

    pub async fn scan_sentences(&self, sentences: Vec<String>) -> ScanReport {
        let started = Instant::now();
        let n = sentences.len();
        let sentences = Arc::new(sentences);
        let settings = self.window_settings();

        let (detectors, unavailable) = self.detectors();
        let mut scan = scan_windows(Arc::clone(&sentences), &detectors, &settings).await;
        let mut sources_extra = unavailable;

        // No working detector at all: fall back to heuristics-only.
        let nothing_ran = scan.sources.iter().all(|s| s.windows_ok == 0);
        let has_heuristic = detectors.iter().any(|d| d.source() == FlagSource::Heuristic);
        if n > 0 && nothing_ran && !has_heuristic {
            warn!("[PIPELINE] no detector succeeded, falling back to heuristics");
            let fallback = vec![self.heuristic()];
            let rescue = scan_windows(Arc::clone(&sentences), &fallback, &settings).await;
            sources_extra.extend(std::mem::take(&mut scan.sources));
            return self.finish(&sentences, rescue, &fallback, sources_extra, started).await;
        }

        self.finish(&sentences, scan, &detectors, sources_extra, started).await
    }

    async fn finish(
        &self,
        sentences: &[String],
        scan: WindowedScan,
        detectors: &[Arc<dyn Detector>],
        extra_sources: Vec<SourceStatus>,
        started: Instant,
    ) -> ScanReport {
        let n = sentences.len();
        let raw = match self.config.combine {
            CombineMode::Union => scan.all_flags(),
            CombineMode::Intersect => intersect_generative(n, &scan, detectors),
        };

        let merged = merge_flags(n, raw);
        let mut flags = validate_flags(sentences, merged, &self.matcher);

        if self.config.llm_polish {
            if let Some(chat) = &self.chat {
                let polished = polish_rationales(chat.as_ref(), sentences, &flags, self.config.llm_timeout_secs).await;
                if !polished.is_empty() {
                    flags.extend(polished);
                    flags = merge_flags(n, flags);
                }
            }
        }

        let mut sources = scan.sources;
        sources.extend(extra_sources);
        let degraded = sources.iter().any(|s| s.is_degraded() || s.last_error.is_some());

        info!(
            "[PIPELINE] done engine={} sentences={} windows={} flags={} degraded={} elapsed_ms={}",
            self.config.engine.as_str(),
            n,
            scan.windows.len(),
            flags.len(),
            degraded,
            started.elapsed().as_millis()
        );

        ScanReport {
            scan_id: uuid::Uuid::new_v4().to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            engine: self.config.engine,
            sentence_count: n,
            window_count: scan.windows.len(),
            flags,
            sources,
            degraded,
        }
    }
}

/// Keep only (category, sentence) pairs reported by both the generative detector and the
/// pattern/semantic detectors. Falls back to the union when either side reported nothing.
fn intersect_generative(n: usize, scan: &WindowedScan, detectors: &[Arc<dyn Detector>]) -> Vec<Flag> {
    let mut generative = Vec::new();
    let mut grounded = Vec::new();
    for (detector, flags) in detectors.iter().zip(&scan.flags) {
        if detector.source() == FlagSource::Llm {
            generative.extend(flags.iter().cloned());
        } else {
            grounded.extend(flags.iter().cloned());
        }
    }

    let gen_merged = merge_flags(n, generative.clone());
    let grounded_merged = merge_flags(n, grounded.clone());
    if gen_merged.is_empty() || grounded_merged.is_empty() {
        return scan.all_flags();
    }

    let index_sets = |flags: &[Flag]| -> HashMap<String, BTreeSet<i64>> {
        flags
            .iter()
            .map(|f| (f.category.clone(), f.sentence_indexes.iter().copied().collect()))
            .collect()
    };
    let gen_sets = index_sets(&gen_merged);
    let grounded_sets = index_sets(&grounded_merged);

    generative
        .into_iter()
        .chain(grounded)
        .filter_map(|mut flag| {
            let category = flag.category.trim().to_string();
            let (a, b) = (gen_sets.get(&category)?, grounded_sets.get(&category)?);
            flag.sentence_indexes.retain(|i| a.contains(i) && b.contains(i));
            Some(flag)
        })
        .collect()
}
