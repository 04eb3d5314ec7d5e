use crate::{
    config::PipelineConfig,
    error::PipelineError,
    pipeline::types::{DocumentChunk, RawDocument},
};

/// Splits a validated document into bounded page-range chunks.
pub trait Chunker: Send + Sync {
    fn chunk(
        &self,
        document: &RawDocument,
        config: &PipelineConfig,
    ) -> Result<Vec<DocumentChunk>, PipelineError>;
}

/// Page-range chunker. Order-preserving; every chunk after the first
/// re-includes the final page(s) of its predecessor as parsing context.
pub struct PageRangeChunker;

impl Chunker for PageRangeChunker {
    fn chunk(
        &self,
        document: &RawDocument,
        config: &PipelineConfig,
    ) -> Result<Vec<DocumentChunk>, PipelineError> {
        let max_pages = config.max_pages_per_chunk.max(1) as u32;
        let context = config.chunk_context_pages.min(config.max_pages_per_chunk) as u32;
        let total = document.page_count as u32;

        // A single page larger than the hard chunk limit cannot be split
        // further; that is the one fatal case here. The heaviest page is
        // found by content-stream size, then serialized through the same
        // path chunk payloads take, so one enormous page cannot hide behind
        // a low document-wide average.
        if let Some(size) = worst_page_size(document)? {
            if size > config.max_chunk_bytes {
                return Err(PipelineError::Validation(format!(
                    "single page serializes to {size} bytes, exceeding per-chunk limit {}",
                    config.max_chunk_bytes
                )));
            }
        }

        let mut chunks = Vec::new();
        let mut start = 1u32;
        let mut index = 0usize;
        while start <= total {
            let end = (start + max_pages - 1).min(total);
            let context_pages = if index == 0 { 0 } else { context.min(start - 1) };
            chunks.push(DocumentChunk {
                index,
                page_start: start - context_pages,
                page_end: end,
                context_pages,
                doc: document.doc.clone(),
                raw: document.bytes.clone(),
            });
            start = end + 1;
            index += 1;
        }

        Ok(chunks)
    }
}

/// Serialized size of the document's heaviest page, by content-stream bytes.
fn worst_page_size(document: &RawDocument) -> Result<Option<usize>, PipelineError> {
    let worst = document
        .doc
        .get_pages()
        .into_iter()
        .max_by_key(|(_, page_id)| {
            document
                .doc
                .get_page_content(*page_id)
                .map(|content| content.len())
                .unwrap_or(0)
        });

    let Some((page, _)) = worst else {
        return Ok(None);
    };

    let probe = DocumentChunk {
        index: 0,
        page_start: page,
        page_end: page,
        context_pages: 0,
        doc: document.doc.clone(),
        raw: document.bytes.clone(),
    };
    Ok(Some(probe.to_bytes()?.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::synthetic_pdf;

    #[test]
    fn chunks_preserve_order_and_overlap() {
        let bytes = synthetic_pdf(&["p1", "p2", "p3", "p4", "p5"]);
        let document = RawDocument::new(bytes, "application/pdf", "user-1").unwrap();
        let config = PipelineConfig {
            max_pages_per_chunk: 2,
            ..PipelineConfig::default()
        };

        let chunks = PageRangeChunker.chunk(&document, &config).unwrap();
        assert_eq!(chunks.len(), 3);

        assert_eq!((chunks[0].page_start, chunks[0].page_end), (1, 2));
        assert_eq!(chunks[0].context_pages, 0);

        // Second chunk re-includes page 2 as context.
        assert_eq!((chunks[1].page_start, chunks[1].page_end), (2, 4));
        assert_eq!(chunks[1].context_pages, 1);

        assert_eq!((chunks[2].page_start, chunks[2].page_end), (4, 5));
    }

    #[test]
    fn oversized_page_cannot_hide_behind_small_ones() {
        let mut heavy = String::new();
        for i in 0..6000 {
            heavy.push_str(&format!("row {i} balance {}\n", i * 7919));
        }
        let mut pages: Vec<&str> = vec![heavy.as_str()];
        pages.extend(std::iter::repeat("filler page").take(19));

        let bytes = synthetic_pdf(&pages);
        let document = RawDocument::new(bytes, "application/pdf", "user-1").unwrap();
        // Limit sits well above the document-wide per-page average but well
        // below the one heavy page.
        let config = PipelineConfig {
            max_chunk_bytes: 8 * 1024,
            ..PipelineConfig::default()
        };

        let err = PageRangeChunker.chunk(&document, &config).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn single_oversized_page_is_fatal() {
        let bytes = synthetic_pdf(&["only page"]);
        let document = RawDocument::new(bytes, "application/pdf", "user-1").unwrap();
        let config = PipelineConfig {
            max_chunk_bytes: 8,
            ..PipelineConfig::default()
        };

        let err = PageRangeChunker.chunk(&document, &config).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
