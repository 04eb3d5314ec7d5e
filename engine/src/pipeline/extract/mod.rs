use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    pipeline::types::{DocumentChunk, ExtractedText, ExtractionMethod, PageText},
};

pub mod cloud;
pub mod ocr;
pub mod structural;
pub mod table;

pub use cloud::{CloudEntity, CloudExtractor, DocIntelClient};
pub use ocr::LocalOcrExtractor;
pub use structural::StructuralExtractor;
pub use table::TableAwareExtractor;

/// One method in the extraction fallback chain.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn method(&self) -> ExtractionMethod;

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError>;
}

/// Trips after a run of consecutive failures and skips the method for the
/// rest of the document instead of failing the whole run.
pub struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= self.threshold
    }

    pub fn record_failure(&self) -> bool {
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        count >= self.threshold
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// Keywords a credit report page is expected to contain. Used only as a
/// density signal, never for parsing.
const REPORT_KEYWORDS: &[&str] = &[
    "account",
    "balance",
    "credit",
    "payment",
    "opened",
    "status",
    "experian",
    "equifax",
    "transunion",
];

/// Density heuristic for extracted text: printable ratio, expected report
/// keywords, minimum character count. Returns a value in [0, 1].
pub fn text_confidence(text: &str, config: &PipelineConfig) -> f32 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let total = trimmed.chars().count();
    let printable = trimmed
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_whitespace())
        .count();
    let printable_ratio = printable as f32 / total as f32;

    let lower = trimmed.to_lowercase();
    let keyword_hits = REPORT_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(**kw))
        .count();
    let keyword_score = (keyword_hits as f32 / 4.0).min(1.0);

    let length_score = if total >= config.min_page_chars {
        1.0
    } else {
        total as f32 / config.min_page_chars as f32
    };

    0.4 * printable_ratio + 0.35 * keyword_score + 0.25 * length_score
}

/// Ordered fallback chain, cheapest method first. "Try the next method" is a
/// data-driven decision on the returned `(confidence, text)` pair.
pub struct FallbackChain {
    extractors: Vec<Arc<dyn TextExtractor>>,
    config: PipelineConfig,
}

impl FallbackChain {
    pub fn new(extractors: Vec<Arc<dyn TextExtractor>>, config: PipelineConfig) -> Self {
        Self { extractors, config }
    }

    /// Per-document view of the chain: the base methods, an optional extra
    /// method whose state lives only as long as this run, and one fresh
    /// breaker per method.
    pub fn run(&self, extra: Option<Arc<dyn TextExtractor>>) -> ChainRun {
        let mut extractors = self.extractors.clone();
        if let Some(extra) = extra {
            extractors.push(extra);
        }
        let breakers = extractors
            .iter()
            .map(|_| CircuitBreaker::new(self.config.circuit_breaker_threshold))
            .collect();
        ChainRun {
            extractors,
            breakers,
            config: self.config.clone(),
        }
    }
}

/// One document's walk through the chain. Breakers trip per run, and any
/// per-run extractor state is dropped with it.
pub struct ChainRun {
    extractors: Vec<Arc<dyn TextExtractor>>,
    breakers: Vec<CircuitBreaker>,
    config: PipelineConfig,
}

impl ChainRun {
    pub async fn extract_chunk(&self, chunk: &DocumentChunk) -> ExtractedText {
        let mut out = ExtractedText {
            chunk_index: chunk.index,
            context_pages: chunk.context_pages,
            ..ExtractedText::default()
        };

        for page in chunk.pages() {
            match self.extract_page(chunk, page).await {
                Some(page_text) => {
                    if page_text.confidence < self.config.extraction_confidence_threshold {
                        out.warnings
                            .push(format!("page {page}: low extraction confidence"));
                    }
                    out.pages.push(page_text);
                }
                None => {
                    warn!(page, chunk = chunk.index, "page unrecoverable by all methods");
                    out.warnings.push(format!(
                        "page {page}: unrecoverable, skipped after all extraction methods"
                    ));
                    out.unrecoverable_pages.push(page);
                }
            }
        }

        out
    }

    /// Walks the chain for one page. Returns the first result at or above
    /// the confidence threshold, otherwise the best non-empty attempt, and
    /// `None` only when every method errored or produced nothing.
    async fn extract_page(&self, chunk: &DocumentChunk, page: u32) -> Option<PageText> {
        let mut best: Option<PageText> = None;

        for (extractor, breaker) in self.extractors.iter().zip(&self.breakers) {
            if breaker.is_open() {
                debug!(method = %extractor.method(), page, "circuit open, skipping method");
                continue;
            }

            match extractor.extract_page(chunk, page).await {
                Ok(text) => {
                    breaker.record_success();
                    let confidence = text_confidence(&text, &self.config);
                    debug!(method = %extractor.method(), page, confidence, "extraction attempt");
                    if confidence >= self.config.extraction_confidence_threshold {
                        return Some(PageText {
                            page,
                            text,
                            method: extractor.method(),
                            confidence,
                        });
                    }
                    if !text.trim().is_empty()
                        && best.as_ref().is_none_or(|b| confidence > b.confidence)
                    {
                        best = Some(PageText {
                            page,
                            text,
                            method: extractor.method(),
                            confidence,
                        });
                    }
                }
                Err(err) => {
                    let tripped = breaker.record_failure();
                    debug!(method = %extractor.method(), page, error = %err, "extraction error");
                    if tripped {
                        warn!(
                            method = %extractor.method(),
                            "circuit breaker tripped, advancing past method for this document"
                        );
                    }
                }
            }
        }

        best
    }
}
