use std::{collections::HashMap, fmt, sync::Arc};

use lopdf::Document;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// A validated upload, alive only until chunking.
pub struct RawDocument {
    pub bytes: Arc<Vec<u8>>,
    pub mime: String,
    pub user_id: String,
    pub page_count: usize,
    pub doc: Arc<Document>,
}

impl RawDocument {
    pub const MAX_BYTES: usize = 64 * 1024 * 1024;

    /// Parses and validates an upload. The only fatal entry point of the
    /// pipeline: a document that fails here is never processed further.
    pub fn new(bytes: Vec<u8>, mime: &str, user_id: &str) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::Validation("empty upload".into()));
        }
        if bytes.len() > Self::MAX_BYTES {
            return Err(PipelineError::Validation(format!(
                "file too large: {} bytes (limit {})",
                bytes.len(),
                Self::MAX_BYTES
            )));
        }
        if mime != "application/pdf" {
            return Err(PipelineError::Validation(format!(
                "unsupported mime type: {mime}"
            )));
        }

        let doc = Document::load_mem(&bytes)
            .map_err(|err| PipelineError::Validation(format!("corrupt pdf: {err}")))?;
        let page_count = doc.get_pages().len();
        if page_count == 0 {
            return Err(PipelineError::Validation("pdf has no pages".into()));
        }

        Ok(Self {
            bytes: Arc::new(bytes),
            mime: mime.to_string(),
            user_id: user_id.to_string(),
            page_count,
            doc: Arc::new(doc),
        })
    }
}

/// A contiguous page range of the parent document.
///
/// `context_pages` leading pages are re-included from the previous chunk so
/// that a tradeline anchored near a chunk boundary is not lost; the merger
/// drops the duplicated text when the predecessor extracted successfully.
#[derive(Clone, Debug)]
pub struct DocumentChunk {
    pub index: usize,
    /// 1-based inclusive page range, context pages included.
    pub page_start: u32,
    pub page_end: u32,
    pub context_pages: u32,
    pub doc: Arc<Document>,
    pub raw: Arc<Vec<u8>>,
}

impl DocumentChunk {
    pub fn pages(&self) -> std::ops::RangeInclusive<u32> {
        self.page_start..=self.page_end
    }

    /// Serializes just this chunk's pages into a standalone pdf, for
    /// collaborators that take bytes rather than a parsed document.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let mut doc = (*self.doc).clone();
        let total = doc.get_pages().len() as u32;
        let outside: Vec<u32> = (1..=total)
            .filter(|p| *p < self.page_start || *p > self.page_end)
            .collect();
        if !outside.is_empty() {
            doc.delete_pages(&outside);
        }
        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|err| PipelineError::Extraction(format!("chunk serialization: {err}")))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionMethod {
    Structural,
    TableAware,
    LocalOcr,
    CloudIntel,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionMethod::Structural => "structural",
            ExtractionMethod::TableAware => "table_aware",
            ExtractionMethod::LocalOcr => "local_ocr",
            ExtractionMethod::CloudIntel => "cloud_intel",
        };
        f.write_str(name)
    }
}

/// Recovered text for one page, tagged with the method that won.
#[derive(Debug, Clone)]
pub struct PageText {
    pub page: u32,
    pub text: String,
    pub method: ExtractionMethod,
    pub confidence: f32,
}

/// Per-chunk extraction output.
#[derive(Debug, Clone, Default)]
pub struct ExtractedText {
    pub chunk_index: usize,
    pub context_pages: u32,
    pub pages: Vec<PageText>,
    pub unrecoverable_pages: Vec<u32>,
    pub warnings: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum Bureau {
    Experian,
    Equifax,
    TransUnion,
    #[default]
    Unknown,
}

impl fmt::Display for Bureau {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Bureau::Experian => "Experian",
            Bureau::Equifax => "Equifax",
            Bureau::TransUnion => "TransUnion",
            Bureau::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BureauGuess {
    pub bureau: Bureau,
    pub confidence: f32,
}

impl BureauGuess {
    pub fn unknown() -> Self {
        Self {
            bureau: Bureau::Unknown,
            confidence: 0.0,
        }
    }
}

/// Raw candidate fields cut out of one account block. Everything stays a
/// string here; canonicalization is the normalizer's job.
#[derive(Debug, Clone, Default)]
pub struct ParsedTradelineCandidate {
    pub creditor_name: Option<String>,
    pub account_number: Option<String>,
    pub balance: Option<String>,
    pub credit_limit: Option<String>,
    pub monthly_payment: Option<String>,
    pub date_opened: Option<String>,
    pub account_type: Option<String>,
    pub account_status: Option<String>,
    pub bureau: Bureau,
    pub page: u32,
    pub snippet: String,
    pub field_confidence: HashMap<&'static str, f32>,
}

impl ParsedTradelineCandidate {
    /// Mean of the per-field extraction confidences, 0 when nothing matched.
    pub fn parse_confidence(&self) -> f32 {
        if self.field_confidence.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.field_confidence.values().sum();
        sum / self.field_confidence.len() as f32
    }
}

pub const UNKNOWN_CREDITOR: &str = "Unknown Creditor";

/// Canonical tradeline as persisted. The account number is already masked by
/// the time a value reaches this type; the raw number never crosses the
/// normalizer boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedTradeline {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub creditor_name: String,
    pub account_number: String,
    pub account_number_prefix: Option<String>,
    pub account_balance: Option<String>,
    pub credit_limit: Option<String>,
    pub monthly_payment: Option<String>,
    pub date_opened: Option<String>,
    pub account_type: Option<String>,
    pub account_status: Option<String>,
    #[serde(default)]
    pub type_unmapped: bool,
    #[serde(default)]
    pub status_unmapped: bool,
    pub credit_bureau: Bureau,
    pub is_negative: bool,
    pub confidence_score: u8,
    #[serde(default)]
    pub low_confidence: bool,
    #[serde(default)]
    pub parse_confidence: f32,
    #[serde(default)]
    pub merge_conflicts: u32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub score: u8,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Result of a dedup upsert. `previous_id` points at the tradeline row the
/// candidate merged into; it is never a bureau label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: String },
    Merged { previous_id: String, conflicts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineStage {
    #[default]
    Init,
    Validating,
    Chunking,
    Extracting,
    Parsing,
    Normalizing,
    ValidatingRecords,
    Deduping,
    Storing,
    Done,
    Failed,
}

/// The structured result every run produces, crash or not.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub detected_bureau: Bureau,
    pub parsed_count: usize,
    pub validated_count: usize,
    pub stored_count: usize,
    pub tradelines: Vec<NormalizedTradeline>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub processing_ms: u64,
}

impl PipelineResult {
    pub fn failed(error: PipelineError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            detected_bureau: Bureau::Unknown,
            parsed_count: 0,
            validated_count: 0,
            stored_count: 0,
            tradelines: Vec::new(),
            warnings: Vec::new(),
            error: Some(error.to_string()),
            processing_ms: elapsed_ms,
        }
    }
}
