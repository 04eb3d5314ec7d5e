use thiserror::Error;

/// Failure taxonomy for the report pipeline.
///
/// Only `Validation` (bad input file) and `Timeout` abort a whole run.
/// `Extraction` is recoverable per chunk via the fallback chain and
/// `Storage` is fatal for a single record only; both are downgraded to
/// warnings by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input document: {0}")]
    Validation(String),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("pipeline timed out after {0}ms")]
    Timeout(u64),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::Timeout(_))
    }
}
