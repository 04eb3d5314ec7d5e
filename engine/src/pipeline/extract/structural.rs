use async_trait::async_trait;

use crate::{
    error::PipelineError,
    pipeline::{
        extract::TextExtractor,
        types::{DocumentChunk, ExtractionMethod},
    },
};

/// Fast structural extraction straight from the pdf text operators. Works on
/// digitally generated reports; returns near-empty text for scanned pages,
/// which the confidence heuristic then rejects.
pub struct StructuralExtractor;

#[async_trait]
impl TextExtractor for StructuralExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Structural
    }

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        chunk
            .doc
            .extract_text(&[page])
            .map_err(|err| PipelineError::Extraction(format!("structural page {page}: {err}")))
    }
}
