// Detector interface shared by heuristic, semantic and generative detection

use crate::models::{Flag, FlagSource};
use crate::services::providers::ProviderError;
use async_trait::async_trait;
use thiserror::Error;

use super::retriever::RetrievalError;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model backend unavailable: {0}")]
    Backend(#[from] ProviderError),
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("detector timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Other(String),
}

/// `detect(sentences) -> flags`, where every cited index is local to `sentences`.
///
/// The scanner owns remapping; detectors never see global positions.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self) -> FlagSource;

    async fn detect(&self, sentences: &[String]) -> Result<Vec<Flag>, DetectError>;
}
