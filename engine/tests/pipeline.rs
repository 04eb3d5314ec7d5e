use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::post};
use engine::{
    config::PipelineConfig,
    error::PipelineError,
    pipeline::{
        Chunker, DocIntelClient, FallbackChain, PageRangeChunker, ReportPipeline, TextExtractor,
        testutil::synthetic_pdf,
        types::{Bureau, DocumentChunk, ExtractionMethod, RawDocument},
    },
    storage::{JsonTradelineStorage, JsonTradelineStorageConfig, TradelineStorage},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Returns a fixed text per page, standing in for a real extraction backend.
struct ScriptedExtractor {
    method: ExtractionMethod,
    pages: HashMap<u32, String>,
}

impl ScriptedExtractor {
    fn new(method: ExtractionMethod, pages: &[(u32, &str)]) -> Self {
        Self {
            method,
            pages: pages
                .iter()
                .map(|(n, text)| (*n, (*text).to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl TextExtractor for ScriptedExtractor {
    fn method(&self) -> ExtractionMethod {
        self.method
    }

    async fn extract_page(
        &self,
        _chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        self.pages
            .get(&page)
            .cloned()
            .ok_or_else(|| PipelineError::Extraction(format!("no scripted text for page {page}")))
    }
}

/// Never finishes; used to exhaust the pipeline deadline.
struct StalledExtractor;

#[async_trait]
impl TextExtractor for StalledExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Structural
    }

    async fn extract_page(
        &self,
        _chunk: &DocumentChunk,
        _page: u32,
    ) -> Result<String, PipelineError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(String::new())
    }
}

/// Cancels the shared token while extracting its first page, standing in for
/// a shutdown signal arriving mid-document.
struct CancellingExtractor {
    token: CancellationToken,
    inner: ScriptedExtractor,
}

#[async_trait]
impl TextExtractor for CancellingExtractor {
    fn method(&self) -> ExtractionMethod {
        self.inner.method()
    }

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        self.token.cancel();
        self.inner.extract_page(chunk, page).await
    }
}

async fn storage_in(dir: &TempDir) -> Arc<JsonTradelineStorage> {
    let storage = Arc::new(JsonTradelineStorage::new(JsonTradelineStorageConfig {
        working_dir: dir.path().to_path_buf(),
    }));
    storage.initialize().await.expect("initialize storage");
    storage
}

fn pipeline_with(
    config: PipelineConfig,
    storage: Arc<JsonTradelineStorage>,
    extractors: Vec<Arc<dyn TextExtractor>>,
) -> ReportPipeline {
    ReportPipeline::with_extractors(config, storage, extractors, None, CancellationToken::new())
}

const TU_PAGE_1: &str = "\
TransUnion Credit Report
Prepared for John Consumer

CAPITAL ONE
Account Number: 411112345678
Date Opened: 03/15/2019
Balance: $1,250
Credit Limit: $5,000
Monthly Payment: $35
Pay Status: Current

CHASE
Account Number: 424212349876
Date Opened: 05/01/2018
Balance: $300
Credit Limit: $2,000
Monthly Payment: $25
Pay Status: Current";

const TU_PAGE_2: &str = "\
DISCOVER
Account Number: 601112340001
Date Opened: 07/10/2020
Balance: $980
Credit Limit: $3,500
Monthly Payment: $40
Pay Status: Current

WELLS FARGO
Account Number: 778812340002
Date Opened: 01/20/2017
Balance: $9,800
Credit Limit: $15,000
Monthly Payment: $310
Pay Status: Current";

const TU_PAGE_3: &str = "\
US BANK
Account Number: 555512340003
Date Opened: 11/05/2021
Balance: $150
Credit Limit: $1,200
Monthly Payment: $25
Pay Status: Current";

#[tokio::test]
async fn five_transunion_blocks_yield_five_high_confidence_rows() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1", "p2", "p3"]);

    let extractor = Arc::new(ScriptedExtractor::new(
        ExtractionMethod::Structural,
        &[(1, TU_PAGE_1), (2, TU_PAGE_2), (3, TU_PAGE_3)],
    ));
    let pipeline = pipeline_with(PipelineConfig::default(), storage.clone(), vec![extractor]);

    let result = pipeline.process(pdf, "application/pdf", "user-1").await;

    assert!(result.success, "warnings: {:?}", result.warnings);
    assert_eq!(result.detected_bureau, Bureau::TransUnion);
    assert_eq!(result.parsed_count, 5);
    assert_eq!(result.stored_count, 5);
    assert_eq!(result.tradelines.len(), 5);

    for tl in &result.tradelines {
        assert_eq!(tl.credit_bureau, Bureau::TransUnion);
        assert!(
            (50..=95).contains(&tl.confidence_score),
            "{} scored {}",
            tl.creditor_name,
            tl.confidence_score
        );
        assert!(!tl.is_negative);
    }
}

#[tokio::test]
async fn stored_account_numbers_are_masked() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1", "p2", "p3"]);

    let extractor = Arc::new(ScriptedExtractor::new(
        ExtractionMethod::Structural,
        &[(1, TU_PAGE_1), (2, TU_PAGE_2), (3, TU_PAGE_3)],
    ));
    let pipeline = pipeline_with(PipelineConfig::default(), storage.clone(), vec![extractor]);
    pipeline.process(pdf, "application/pdf", "user-1").await;

    let rows = storage.list_for_user("user-1").await.unwrap();
    assert!(!rows.is_empty());
    for tl in rows {
        let prefix = tl.account_number_prefix.as_deref().unwrap();
        assert_eq!(prefix.len(), 4);
        assert!(tl.account_number.starts_with(prefix));
        assert!(tl.account_number[prefix.len()..].chars().all(|c| c == 'X'));
        assert_eq!(tl.account_number.len(), 12);
    }
}

#[tokio::test]
async fn reprocessing_the_same_report_stores_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1", "p2", "p3"]);

    let pages: &[(u32, &str)] = &[(1, TU_PAGE_1), (2, TU_PAGE_2), (3, TU_PAGE_3)];
    let pipeline = pipeline_with(
        PipelineConfig::default(),
        storage.clone(),
        vec![Arc::new(ScriptedExtractor::new(
            ExtractionMethod::Structural,
            pages,
        ))],
    );

    let first = pipeline.process(pdf.clone(), "application/pdf", "user-1").await;
    assert_eq!(first.stored_count, 5);

    let second = pipeline.process(pdf, "application/pdf", "user-1").await;
    assert!(second.success);
    assert!(
        second.warnings.iter().any(|w| w.contains("merged duplicate")),
        "expected merge warnings, got {:?}",
        second.warnings
    );

    let rows = storage.list_for_user("user-1").await.unwrap();
    assert_eq!(rows.len(), 5);
}

fn bureau_report(header: &str, status_label: &str) -> String {
    format!(
        "{header}\n\nCHASE\nAccount Number: 424212345678\nDate Opened: 05/01/2018\nBalance: $300\n{status_label}: Current"
    )
}

#[tokio::test]
async fn same_account_coexists_across_bureaus_but_not_within_one() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;

    let reports = [
        bureau_report("TransUnion Credit Report", "Pay Status"),
        bureau_report("Equifax Information Services", "Account Status"),
        bureau_report("Experian Information Solutions", "Status"),
        // Bureau duplicate of the first run; merges instead of inserting.
        bureau_report("TransUnion Credit Report", "Pay Status"),
    ];

    for report in &reports {
        let pdf = synthetic_pdf(&["p1"]);
        let pipeline = pipeline_with(
            PipelineConfig::default(),
            storage.clone(),
            vec![Arc::new(ScriptedExtractor::new(
                ExtractionMethod::Structural,
                &[(1, report)],
            ))],
        );
        let result = pipeline.process(pdf, "application/pdf", "user-1").await;
        assert!(result.success, "warnings: {:?}", result.warnings);
    }

    let rows = storage.list_for_user("user-1").await.unwrap();
    assert_eq!(rows.len(), 3);
    let bureaus: Vec<Bureau> = rows.iter().map(|tl| tl.credit_bureau).collect();
    assert!(bureaus.contains(&Bureau::TransUnion));
    assert!(bureaus.contains(&Bureau::Equifax));
    assert!(bureaus.contains(&Bureau::Experian));
}

#[tokio::test]
async fn charged_off_account_is_flagged_negative() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1"]);

    let page = "\
TransUnion Credit Report

CREDIT ONE
Account Number: 444412340009
Date Opened: 02/01/2016
Balance: $2,100
Pay Status: Charged Off";

    let pipeline = pipeline_with(
        PipelineConfig::default(),
        storage.clone(),
        vec![Arc::new(ScriptedExtractor::new(
            ExtractionMethod::Structural,
            &[(1, page)],
        ))],
    );
    let result = pipeline.process(pdf, "application/pdf", "user-1").await;

    assert_eq!(result.stored_count, 1);
    let tl = &result.tradelines[0];
    assert!(tl.is_negative);
    assert_eq!(tl.account_status.as_deref(), Some("Charged Off"));
}

#[tokio::test]
async fn garbled_page_falls_through_to_a_later_method() {
    let document =
        RawDocument::new(synthetic_pdf(&["p1"]), "application/pdf", "user-1").unwrap();
    let config = PipelineConfig::default();
    let chunks = PageRangeChunker.chunk(&document, &config).unwrap();

    let garbled = Arc::new(ScriptedExtractor::new(
        ExtractionMethod::Structural,
        &[(1, "\u{fffd}\u{fffd}~~")],
    ));
    let readable = Arc::new(ScriptedExtractor::new(
        ExtractionMethod::TableAware,
        &[(1, TU_PAGE_3)],
    ));

    let chain = FallbackChain::new(vec![garbled, readable], config);
    let extracted = chain.run(None).extract_chunk(&chunks[0]).await;

    assert_eq!(extracted.pages.len(), 1);
    assert_eq!(extracted.pages[0].method, ExtractionMethod::TableAware);
}

#[tokio::test]
async fn report_without_tradelines_succeeds_with_zero_rows() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1"]);

    let page = "TransUnion Credit Report\nINQUIRIES\nSUMMARY\nNothing reported this period";
    let pipeline = pipeline_with(
        PipelineConfig::default(),
        storage.clone(),
        vec![Arc::new(ScriptedExtractor::new(
            ExtractionMethod::Structural,
            &[(1, page)],
        ))],
    );
    let result = pipeline.process(pdf, "application/pdf", "user-1").await;

    assert!(result.success);
    assert_eq!(result.stored_count, 0);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn corrupt_upload_fails_without_panicking() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;

    let pipeline = pipeline_with(
        PipelineConfig::default(),
        storage.clone(),
        vec![Arc::new(ScriptedExtractor::new(
            ExtractionMethod::Structural,
            &[],
        ))],
    );

    let result = pipeline
        .process(b"not a pdf at all".to_vec(), "application/pdf", "user-1")
        .await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("invalid input document"));

    let result = pipeline
        .process(synthetic_pdf(&["p1"]), "text/plain", "user-1")
        .await;
    assert!(!result.success);
}

#[tokio::test]
async fn exhausted_deadline_returns_partial_result() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1"]);

    let config = PipelineConfig {
        pipeline_timeout_secs: 1,
        ..PipelineConfig::default()
    };
    let pipeline = pipeline_with(config, storage.clone(), vec![Arc::new(StalledExtractor)]);

    let result = pipeline.process(pdf, "application/pdf", "user-1").await;
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert!(result.warnings.iter().any(|w| w.contains("timed_out")));
}

#[tokio::test]
async fn shutdown_mid_run_stops_new_chunks_and_keeps_partial_results() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let pdf = synthetic_pdf(&["p1", "p2", "p3"]);

    let token = CancellationToken::new();
    let config = PipelineConfig {
        max_pages_per_chunk: 1,
        chunk_context_pages: 0,
        extraction_concurrency: 1,
        ..PipelineConfig::default()
    };
    let extractor = Arc::new(CancellingExtractor {
        token: token.clone(),
        inner: ScriptedExtractor::new(
            ExtractionMethod::Structural,
            &[(1, TU_PAGE_1), (2, TU_PAGE_2), (3, TU_PAGE_3)],
        ),
    });
    let pipeline = ReportPipeline::with_extractors(
        config,
        storage.clone(),
        vec![extractor],
        None,
        token.clone(),
    );

    let result = pipeline.process(pdf, "application/pdf", "user-1").await;

    // The first chunk was already in flight and ran to completion; the other
    // two pages were never submitted.
    assert!(
        result.warnings.iter().any(|w| w.contains("shutdown requested")),
        "warnings: {:?}",
        result.warnings
    );
    assert_eq!(result.stored_count, 2, "only page one's two accounts land");

    // Once cancelled, new documents are refused outright.
    let refused = pipeline
        .process(synthetic_pdf(&["p1"]), "application/pdf", "user-1")
        .await;
    assert!(!refused.success);
    assert!(refused.error.as_deref().unwrap().contains("shutting down"));
}

async fn doc_intel_stub(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route("/v1/analyze", post(analyze_stub))
        .with_state(hits);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Answers every analysis request with a different account block, so a cached
/// response reused across documents is observable as the wrong creditor.
async fn analyze_stub(State(hits): State<Arc<AtomicUsize>>) -> Json<serde_json::Value> {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    let creditor = if n == 0 { "CAPITAL ONE" } else { "DISCOVER" };
    let text = format!(
        "TransUnion Credit Report\n\n{creditor}\nAccount Number: {n}11112345678\nDate Opened: 01/15/2020\nBalance: $500\nCredit Limit: $1,000\nMonthly Payment: $25\nPay Status: Current"
    );
    Json(serde_json::json!({
        "pages": [{ "page": 1, "text": text, "confidence": 0.9 }],
        "entities": []
    }))
}

#[tokio::test]
async fn cloud_analysis_never_crosses_documents() {
    let dir = TempDir::new().unwrap();
    let storage = storage_in(&dir).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let base = doc_intel_stub(hits.clone()).await;

    let config = PipelineConfig::default();
    let client = Arc::new(DocIntelClient::new(base, "test-key".into(), &config));
    let pipeline = ReportPipeline::with_extractors(
        config,
        storage.clone(),
        Vec::new(),
        Some(client),
        CancellationToken::new(),
    );

    let first = pipeline
        .process(synthetic_pdf(&["first report"]), "application/pdf", "user-a")
        .await;
    assert!(first.success, "warnings: {:?}", first.warnings);

    let second = pipeline
        .process(synthetic_pdf(&["second report"]), "application/pdf", "user-b")
        .await;
    assert!(second.success, "warnings: {:?}", second.warnings);

    // Both documents chunk to index zero; each must reach the service with
    // its own bytes rather than replaying the other's analysis.
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let rows = storage.list_for_user("user-b").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].creditor_name, "DISCOVER");
}
