use std::{env, path::PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "config/app.yaml";

/// Application-level configuration loaded from `config/app.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub working_dir: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Immutable tuning knobs for one pipeline instance.
///
/// Threaded through the pipeline explicitly; there is no module-level
/// mutable state. The thresholds are tunable defaults, not contracts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on pages per chunk.
    pub max_pages_per_chunk: usize,
    /// Pages from the end of the previous chunk re-included as context.
    pub chunk_context_pages: usize,
    /// Hard limit on the rendered size of a single chunk, in bytes.
    pub max_chunk_bytes: usize,
    /// Minimum text confidence before the next extraction method is tried.
    pub extraction_confidence_threshold: f32,
    /// Pages below this many characters are considered empty.
    pub min_page_chars: usize,
    /// Parallelism of the chunk extraction worker pool.
    pub extraction_concurrency: usize,
    /// Confidence gap under which the bureau detector refuses to guess.
    pub bureau_epsilon: f32,
    /// Continuation lines merged into a block before a forced cut.
    pub max_block_lines: usize,
    /// Leading account-number digits kept unmasked.
    pub account_prefix_len: usize,
    /// Records scoring below this are dropped from storage.
    pub min_validation_score: u8,
    /// Records scoring at or above this are stored as high-confidence.
    pub high_confidence_score: u8,
    /// Overall wall-clock budget for one document.
    pub pipeline_timeout_secs: u64,
    /// Per-call timeout for the cloud document-intelligence service.
    pub cloud_timeout_secs: u64,
    /// Bounded retries for transient cloud errors.
    pub cloud_max_retries: u32,
    /// Consecutive failures before a method is skipped for the document.
    pub circuit_breaker_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pages_per_chunk: 30,
            chunk_context_pages: 1,
            max_chunk_bytes: 32 * 1024 * 1024,
            extraction_confidence_threshold: 0.5,
            min_page_chars: 40,
            extraction_concurrency: 4,
            bureau_epsilon: 0.15,
            max_block_lines: 40,
            account_prefix_len: 4,
            min_validation_score: 30,
            high_confidence_score: 70,
            pipeline_timeout_secs: 120,
            cloud_timeout_secs: 30,
            cloud_max_retries: 3,
            circuit_breaker_threshold: 3,
        }
    }
}

pub async fn load_config() -> Result<AppConfig> {
    let path = config_path();
    let contents = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: AppConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    info!(path = %path.display(), "Configuration loaded from disk");
    Ok(config)
}

fn config_path() -> PathBuf {
    env::var("APP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
