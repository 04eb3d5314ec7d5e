use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    pipeline::{
        bureau::BureauDetector,
        chunker::{Chunker, PageRangeChunker},
        dedup::DeduplicationEngine,
        extract::{
            CloudExtractor, DocIntelClient, FallbackChain, LocalOcrExtractor,
            StructuralExtractor, TableAwareExtractor, TextExtractor,
        },
        normalizer::FieldNormalizer,
        parser::{MergedLine, TradelineParser},
        types::{
            Bureau, ExtractedText, NormalizedTradeline, PageText, PipelineResult, PipelineStage,
            RawDocument, UpsertOutcome,
        },
        validator::{ValidationContext, select_validator},
    },
    storage::TradelineStorage,
};

/// Running tally shared with the timeout arm, so an exhausted deadline still
/// returns whatever was already stored.
#[derive(Default)]
struct Progress {
    stage: PipelineStage,
    detected_bureau: Bureau,
    parsed_count: usize,
    validated_count: usize,
    stored_count: usize,
    tradelines: Vec<NormalizedTradeline>,
    warnings: Vec<String>,
}

/// The whole report pipeline: validate, chunk, extract, detect bureau, parse,
/// normalize, validate records, dedup, store.
pub struct ReportPipeline {
    config: PipelineConfig,
    chunker: Arc<dyn Chunker>,
    chain: FallbackChain,
    cloud_client: Option<Arc<DocIntelClient>>,
    detector: BureauDetector,
    parser: TradelineParser,
    normalizer: FieldNormalizer,
    dedup: DeduplicationEngine,
    storage: Arc<dyn TradelineStorage>,
    shutdown: CancellationToken,
}

impl ReportPipeline {
    /// Builds the default extractor chain. The cloud method joins the chain
    /// only when its credentials are configured, and only per run: its chunk
    /// cache and entities must never outlive one document.
    pub fn new(
        config: PipelineConfig,
        storage: Arc<dyn TradelineStorage>,
        shutdown: CancellationToken,
    ) -> Self {
        let extractors: Vec<Arc<dyn TextExtractor>> = vec![
            Arc::new(StructuralExtractor),
            Arc::new(TableAwareExtractor),
            Arc::new(LocalOcrExtractor::new()),
        ];
        let cloud_client = DocIntelClient::from_env(&config).map(Arc::new);
        if cloud_client.is_none() {
            info!("document-intelligence credentials absent, cloud extraction disabled");
        }

        Self::with_extractors(config, storage, extractors, cloud_client, shutdown)
    }

    /// Dependency-injecting constructor; tests swap in synthetic extractors.
    pub fn with_extractors(
        config: PipelineConfig,
        storage: Arc<dyn TradelineStorage>,
        extractors: Vec<Arc<dyn TextExtractor>>,
        cloud_client: Option<Arc<DocIntelClient>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chunker: Arc::new(PageRangeChunker),
            chain: FallbackChain::new(extractors, config.clone()),
            cloud_client,
            detector: BureauDetector::new(config.bureau_epsilon),
            parser: TradelineParser::new(config.max_block_lines),
            normalizer: FieldNormalizer::new(&config),
            dedup: DeduplicationEngine::new(storage.clone()),
            storage,
            config,
            shutdown,
        }
    }

    /// Runs one uploaded report end to end. Never panics and never returns
    /// `Err`; every failure mode folds into the result object.
    pub async fn process(&self, bytes: Vec<u8>, mime: &str, user_id: &str) -> PipelineResult {
        let started = Instant::now();

        if self.shutdown.is_cancelled() {
            return PipelineResult::failed(
                PipelineError::Validation("shutting down, not accepting work".into()),
                0,
            );
        }

        let progress = Arc::new(Mutex::new(Progress::default()));
        let deadline = Duration::from_secs(self.config.pipeline_timeout_secs);

        let run = self.run(bytes, mime, user_id, progress.clone(), started);
        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(user_id, "pipeline deadline exhausted, returning partial results");
                // Rows stored before the deadline must survive the abort.
                if let Err(err) = self.storage.sync_if_dirty().await {
                    warn!(error = %err, "post-timeout storage sync failed");
                }

                let progress = progress.lock().await;
                let mut warnings = progress.warnings.clone();
                warnings.push("timed_out: results are partial".into());
                PipelineResult {
                    success: false,
                    detected_bureau: progress.detected_bureau,
                    parsed_count: progress.parsed_count,
                    validated_count: progress.validated_count,
                    stored_count: progress.stored_count,
                    tradelines: progress.tradelines.clone(),
                    warnings,
                    error: Some(
                        PipelineError::Timeout(deadline.as_millis() as u64).to_string(),
                    ),
                    processing_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn run(
        &self,
        bytes: Vec<u8>,
        mime: &str,
        user_id: &str,
        progress: Arc<Mutex<Progress>>,
        started: Instant,
    ) -> PipelineResult {
        set_stage(&progress, PipelineStage::Validating).await;
        let document = match RawDocument::new(bytes, mime, user_id) {
            Ok(doc) => doc,
            Err(err) => {
                set_stage(&progress, PipelineStage::Failed).await;
                return PipelineResult::failed(err, started.elapsed().as_millis() as u64);
            }
        };
        info!(user_id, pages = document.page_count, "report accepted");

        set_stage(&progress, PipelineStage::Chunking).await;
        let chunks = match self.chunker.chunk(&document, &self.config) {
            Ok(chunks) => chunks,
            Err(err) => {
                set_stage(&progress, PipelineStage::Failed).await;
                return PipelineResult::failed(err, started.elapsed().as_millis() as u64);
            }
        };
        debug!(chunks = chunks.len(), "document chunked");

        set_stage(&progress, PipelineStage::Extracting).await;
        let cloud = self
            .cloud_client
            .clone()
            .map(|client| Arc::new(CloudExtractor::new(client)));
        let chain = self
            .chain
            .run(cloud.clone().map(|c| c as Arc<dyn TextExtractor>));
        let total_chunks = chunks.len();
        let shutdown = &self.shutdown;
        // Shutdown stops submission of further chunks; chunks already in the
        // pool run to completion and their pages stay in the result.
        let mut extracted: Vec<ExtractedText> = stream::iter(chunks)
            .take_while(|_| futures::future::ready(!shutdown.is_cancelled()))
            .map(|chunk| {
                let chain = &chain;
                async move { chain.extract_chunk(&chunk).await }
            })
            .buffer_unordered(self.config.extraction_concurrency)
            .collect()
            .await;
        extracted.sort_by_key(|e| e.chunk_index);

        if extracted.len() < total_chunks {
            warn!(
                user_id,
                extracted = extracted.len(),
                total = total_chunks,
                "shutdown requested mid-extraction, continuing with partial text"
            );
            progress.lock().await.warnings.push(
                "shutdown requested: extraction stopped early, results are partial".into(),
            );
        }

        {
            let mut progress = progress.lock().await;
            for chunk in &extracted {
                progress.warnings.extend(chunk.warnings.iter().cloned());
            }
        }

        let pages = merge_pages(extracted);
        if pages.is_empty() {
            let mut progress = progress.lock().await;
            progress.warnings.push("no text recovered from any page".into());
            return finish(&progress, started, true);
        }

        let merged_text: String = pages
            .values()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let guess = self.detector.detect(&merged_text);
        info!(bureau = %guess.bureau, confidence = guess.confidence, "bureau detected");
        progress.lock().await.detected_bureau = guess.bureau;

        set_stage(&progress, PipelineStage::Parsing).await;
        let lines = to_lines(&pages);
        let candidates = self.parser.parse(&lines, guess);
        progress.lock().await.parsed_count = candidates.len();
        debug!(candidates = candidates.len(), "tradeline candidates parsed");

        let entities = match &cloud {
            Some(cloud) => cloud.collected_entities().await,
            None => Vec::new(),
        };
        let validator = select_validator(&self.config, !entities.is_empty());
        let ctx = ValidationContext { entities };

        for candidate in candidates {
            set_stage(&progress, PipelineStage::Normalizing).await;
            let (mut tradeline, norm_warnings) = self.normalizer.normalize(&candidate, user_id);
            {
                let mut progress = progress.lock().await;
                progress
                    .warnings
                    .extend(norm_warnings.into_iter().map(|w| {
                        format!("page {}: {w}", candidate.page)
                    }));
            }

            set_stage(&progress, PipelineStage::ValidatingRecords).await;
            let verdict = validator.validate(&tradeline, &ctx);
            if !verdict.valid {
                let mut progress = progress.lock().await;
                progress.warnings.push(format!(
                    "page {}: record rejected (score {}): {}",
                    candidate.page,
                    verdict.score,
                    verdict.errors.join("; ")
                ));
                continue;
            }
            tradeline.confidence_score = verdict.score;
            tradeline.low_confidence = verdict.score < self.config.high_confidence_score;
            {
                let mut progress = progress.lock().await;
                progress.validated_count += 1;
                progress
                    .warnings
                    .extend(verdict.warnings.into_iter().map(|w| {
                        format!("page {}: {w}", candidate.page)
                    }));
            }

            set_stage(&progress, PipelineStage::Deduping).await;
            match self.dedup.upsert(tradeline).await {
                Ok(outcome) => {
                    let id = match &outcome {
                        UpsertOutcome::Inserted { id } => id.clone(),
                        UpsertOutcome::Merged {
                            previous_id,
                            conflicts,
                        } => {
                            let mut progress = progress.lock().await;
                            progress.warnings.push(format!(
                                "merged duplicate into {previous_id} ({conflicts} conflicting fields)"
                            ));
                            previous_id.clone()
                        }
                    };

                    set_stage(&progress, PipelineStage::Storing).await;
                    match self.storage.get(&id).await {
                        Ok(Some(stored)) => {
                            let mut progress = progress.lock().await;
                            progress.stored_count += 1;
                            progress.tradelines.retain(|tl| tl.id != stored.id);
                            progress.tradelines.push(stored);
                        }
                        Ok(None) => {
                            warn!(%id, "stored row vanished between upsert and readback");
                        }
                        Err(err) => {
                            let mut progress = progress.lock().await;
                            progress.warnings.push(format!("storage readback failed: {err}"));
                        }
                    }
                }
                Err(err) => {
                    let mut progress = progress.lock().await;
                    progress
                        .warnings
                        .push(format!("page {}: upsert failed: {err}", candidate.page));
                }
            }
        }

        if let Err(err) = self.storage.sync_if_dirty().await {
            let mut progress = progress.lock().await;
            progress.warnings.push(format!("storage sync failed: {err}"));
        }

        set_stage(&progress, PipelineStage::Done).await;
        let progress = progress.lock().await;
        info!(
            user_id,
            parsed = progress.parsed_count,
            validated = progress.validated_count,
            stored = progress.stored_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        finish(&progress, started, true)
    }
}

async fn set_stage(progress: &Arc<Mutex<Progress>>, stage: PipelineStage) {
    let mut guard = progress.lock().await;
    if guard.stage != stage {
        debug!(?stage, "pipeline stage transition");
        guard.stage = stage;
    }
}

fn finish(progress: &Progress, started: Instant, success: bool) -> PipelineResult {
    PipelineResult {
        success,
        detected_bureau: progress.detected_bureau,
        parsed_count: progress.parsed_count,
        validated_count: progress.validated_count,
        stored_count: progress.stored_count,
        tradelines: progress.tradelines.clone(),
        warnings: progress.warnings.clone(),
        error: None,
        processing_ms: started.elapsed().as_millis() as u64,
    }
}

/// Collapses per-chunk extractions into one text per page. Context pages are
/// extracted twice by neighboring chunks; the higher-confidence reading wins.
fn merge_pages(extracted: Vec<ExtractedText>) -> BTreeMap<u32, PageText> {
    let mut pages: BTreeMap<u32, PageText> = BTreeMap::new();
    for chunk in extracted {
        for page in chunk.pages {
            match pages.get(&page.page) {
                Some(existing) if existing.confidence >= page.confidence => {}
                _ => {
                    pages.insert(page.page, page);
                }
            }
        }
    }
    pages
}

fn to_lines(pages: &BTreeMap<u32, PageText>) -> Vec<MergedLine> {
    let mut lines = Vec::new();
    for (number, page) in pages {
        for line in page.text.lines() {
            lines.push(MergedLine {
                page: *number,
                text: line.to_string(),
            });
        }
    }
    lines
}
