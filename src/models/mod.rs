// TOSCheck Data Models
// Flags, windows and scan reports shared by every detector

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============ Flag Source ============

/// Which detector produced a flag. Only used to break rationale ties during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    LlmPolish,
    Llm,
    Heuristic,
    Rag,
    #[default]
    Unknown,
}

impl FlagSource {
    /// Rationale priority: polished > raw LLM > pattern match > anything else.
    pub fn priority(self) -> u8 {
        match self {
            FlagSource::LlmPolish => 3,
            FlagSource::Llm => 2,
            FlagSource::Heuristic => 1,
            FlagSource::Rag | FlagSource::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlagSource::LlmPolish => "llm_polish",
            FlagSource::Llm => "llm",
            FlagSource::Heuristic => "heuristic",
            FlagSource::Rag => "rag",
            FlagSource::Unknown => "unknown",
        }
    }
}

// ============ Flag ============

/// Per-sentence audit detail attached by the semantic detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub sentence_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// A (category, evidence, rationale) record asserting a document may contain a risky clause.
///
/// `sentence_indexes` is signed because detector output is untrusted: negative or
/// out-of-range citations are carried until the merge/validate boundary drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub category: String,
    #[serde(default)]
    pub sentence_indexes: Vec<i64>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FlagSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
}

impl Flag {
    pub fn new(category: impl Into<String>, sentence_indexes: Vec<i64>, rationale: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            sentence_indexes,
            rationale: rationale.into(),
            source: None,
            evidence: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: FlagSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn source_or_default(&self) -> FlagSource {
        self.source.unwrap_or_default()
    }

    /// Unique indexes that fall inside `[0, sentence_count)`, ascending.
    pub fn valid_indexes(&self, sentence_count: usize) -> BTreeSet<usize> {
        self.sentence_indexes
            .iter()
            .filter(|&&i| i >= 0 && (i as u64) < sentence_count as u64)
            .map(|&i| i as usize)
            .collect()
    }
}

// ============ Window ============

/// Half-open `[start, end)` range over the global sentence sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end: end.max(start) }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, global: usize) -> bool {
        global >= self.start && global < self.end
    }

    pub fn slice<'a>(&self, sentences: &'a [String]) -> &'a [String] {
        let end = self.end.min(sentences.len());
        let start = self.start.min(end);
        &sentences[start..end]
    }

    /// Convert window-local citations to global ones (`global = start + local`).
    ///
    /// Local indexes outside `[0, len)` are mis-indexed citations and are dropped here, so
    /// every index that leaves the window lies inside `[start, end)`. Flags that lose every
    /// index keep their (now empty) index list; merge discards them.
    pub fn remap(&self, flags: Vec<Flag>) -> Vec<Flag> {
        let len = self.len() as i64;
        let start = self.start as i64;
        flags
            .into_iter()
            .map(|mut flag| {
                flag.sentence_indexes = flag
                    .sentence_indexes
                    .iter()
                    .filter(|&&local| local >= 0 && local < len)
                    .map(|&local| start + local)
                    .collect();
                flag.evidence = flag
                    .evidence
                    .into_iter()
                    .filter(|e| e.sentence_index >= 0 && e.sentence_index < len)
                    .map(|mut e| {
                        e.sentence_index += start;
                        e
                    })
                    .collect();
                flag
            })
            .collect()
    }
}

// ============ Scan Engine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanEngine {
    Heuristics,
    Rag,
    Llm,
    #[default]
    Hybrid,
}

impl ScanEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanEngine::Heuristics => "heuristics",
            ScanEngine::Rag => "rag",
            ScanEngine::Llm => "llm",
            ScanEngine::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "heuristics" | "heuristic" => Some(ScanEngine::Heuristics),
            "rag" => Some(ScanEngine::Rag),
            "llm" => Some(ScanEngine::Llm),
            "hybrid" => Some(ScanEngine::Hybrid),
            _ => None,
        }
    }
}

/// How semantic/heuristic hits combine with generative hits in hybrid mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    #[default]
    Union,
    Intersect,
}

// ============ Scan Report ============

/// Per-detector outcome across all windows of one scan.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub detector: String,
    pub windows_ok: usize,
    pub windows_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SourceStatus {
    pub fn is_degraded(&self) -> bool {
        self.windows_failed > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: String,
    pub generated_at: String,
    pub engine: ScanEngine,
    pub sentence_count: usize,
    pub window_count: usize,
    pub flags: Vec<Flag>,
    pub sources: Vec<SourceStatus>,
    pub degraded: bool,
}
