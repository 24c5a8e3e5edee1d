// TOSCheck Core Services

pub mod text_processor;
pub mod config_store;
pub mod providers;
pub mod detection;
pub mod sentence_segmenter;
pub mod embedding_cache;

pub use text_processor::*;
pub use config_store::*;
pub use providers::*;
pub use sentence_segmenter::*;
pub use embedding_cache::*;

pub use detection::{
    answer_query,
    explain_clauses,
    merge_flags,
    validate_flags,
    FlagPipeline,
    PassageIndex,
    PatternMatcher,
};
