pub mod bureau;
pub mod chunker;
pub mod dedup;
pub mod extract;
pub mod normalizer;
pub mod parser;
pub mod pipeline;
pub mod types;
pub mod validator;

#[doc(hidden)]
pub mod testutil;

pub use bureau::BureauDetector;
pub use chunker::{Chunker, PageRangeChunker};
pub use dedup::{DeduplicationEngine, DeduplicationKey, normalize_creditor_name};
pub use extract::{ChainRun, DocIntelClient, FallbackChain, TextExtractor};
pub use normalizer::FieldNormalizer;
pub use parser::{MergedLine, TradelineParser};
pub use pipeline::ReportPipeline;
pub use validator::{ValidationContext, Validator, select_validator};
