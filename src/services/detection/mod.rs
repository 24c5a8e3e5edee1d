// Detection Module
// Risky clause detection organized into specialized submodules:
// - patterns / heuristic: category rule catalog and pattern-ranked suspects
// - retriever / rag / passage_index: embeddings, seed similarity, KB passages
// - llm_analyzer / output_parser: generative detection and tolerant reply parsing
// - window_scanner / merge / validate: windowed fan-out, flag merging, citation checks
// - pipeline: end-to-end scan; explain: KB-backed clause explanations

pub mod patterns;
pub mod detector;
pub mod heuristic;
pub mod retriever;
pub mod rag;
pub mod passage_index;
pub mod output_parser;
pub mod llm_analyzer;
pub mod window_scanner;
pub mod merge;
pub mod validate;
pub mod pipeline;
pub mod explain;

// Re-export commonly used items
pub use detector::{DetectError, Detector};
pub use explain::{answer_query, explain_clauses, likely_category, ExplainError, ExplainSettings, Explanation, QueryAnswer};
pub use heuristic::{rank_suspects, HeuristicDetector};
pub use llm_analyzer::{polish_rationales, LlmDetector};
pub use merge::merge_flags;
pub use passage_index::{diversify_by_source, label_chunks, IndexError, PassageHit, PassageIndex};
pub use patterns::{PatternError, PatternMatcher};
pub use pipeline::{DocumentScan, FlagPipeline};
pub use rag::{RagDetector, SeedSet};
pub use retriever::{EmbeddingRetriever, RetrievalError};
pub use validate::validate_flags;
pub use window_scanner::{plan_windows, scan_windows, WindowSettings, WindowedScan};
