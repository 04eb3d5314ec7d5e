use std::{collections::HashMap, env, sync::Arc};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use tokio::{
    sync::Mutex,
    time::{Duration, sleep},
};
use tracing::{debug, warn};

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    pipeline::{
        extract::TextExtractor,
        types::{DocumentChunk, ExtractionMethod},
    },
};

/// A structured entity the document-intelligence service recognized, kept as
/// a bonus signal for ML-assisted validation.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudEntity {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub page: u32,
}

#[derive(Debug, Deserialize)]
pub struct DocIntelResponse {
    #[serde(default)]
    pub pages: Vec<DocIntelPage>,
    #[serde(default)]
    pub entities: Vec<CloudEntity>,
}

#[derive(Debug, Deserialize)]
pub struct DocIntelPage {
    pub page: u32,
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Client for the external document-intelligence collaborator.
///
/// Auth, quota and rate-limit errors are transient and retried with backoff
/// and jitter; malformed-document errors are fatal for the affected chunk
/// only and surface as `PipelineError::Extraction`.
pub struct DocIntelClient {
    http: Client,
    base: String,
    api_key: String,
    max_retries: u32,
}

impl DocIntelClient {
    pub fn new(base: String, api_key: String, config: &PipelineConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.cloud_timeout_secs))
            .build()
            .expect("client");
        Self {
            http,
            base,
            api_key,
            max_retries: config.cloud_max_retries,
        }
    }

    /// Reads `DOC_INTEL_URL` / `DOC_INTEL_API_KEY`; the capability is simply
    /// absent when they are unset.
    pub fn from_env(config: &PipelineConfig) -> Option<Self> {
        let base = env::var("DOC_INTEL_URL").ok()?;
        let api_key = env::var("DOC_INTEL_API_KEY").ok()?;
        Some(Self::new(base, api_key, config))
    }

    pub async fn analyze(
        &self,
        bytes: &[u8],
        mime: &str,
    ) -> Result<DocIntelResponse, PipelineError> {
        let mut delay = Duration::from_millis(300);

        for attempt in 0..=self.max_retries {
            let response = self
                .http
                .post(format!("{}/v1/analyze", self.base))
                .bearer_auth(&self.api_key)
                .header(CONTENT_TYPE, mime)
                .body(bytes.to_vec())
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<DocIntelResponse>().await.map_err(|err| {
                        PipelineError::Extraction(format!("doc-intel response decode: {err}"))
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let transient = status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::UNAUTHORIZED
                        || status == StatusCode::FORBIDDEN
                        || status.is_server_error();
                    if transient && attempt < self.max_retries {
                        debug!(%status, attempt, "transient doc-intel error, backing off");
                        sleep(delay).await;
                        delay = Duration::from_millis((delay.as_millis() as f64 * 1.8) as u64)
                            + Duration::from_millis(fastrand::u64(0..250));
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(PipelineError::Extraction(format!(
                        "doc-intel error {status}: {body}"
                    )));
                }
                Err(err) => {
                    if attempt < self.max_retries {
                        debug!(error = %err, attempt, "doc-intel network error, backing off");
                        sleep(delay).await;
                        delay = Duration::from_millis((delay.as_millis() as f64 * 1.8) as u64)
                            + Duration::from_millis(fastrand::u64(0..250));
                        continue;
                    }
                    return Err(PipelineError::Extraction(format!(
                        "doc-intel network error: {err}"
                    )));
                }
            }
        }

        Err(PipelineError::Extraction("doc-intel retries exhausted".into()))
    }
}

/// Last resort in the fallback chain. One analyze call per chunk, cached, so
/// per-page requests from the chain do not re-upload the chunk.
///
/// Built fresh for every document run: the chunk cache and the collected
/// entities belong to exactly one document and are dropped with the run. Only
/// the underlying `DocIntelClient` outlives it.
pub struct CloudExtractor {
    client: Arc<DocIntelClient>,
    cache: Mutex<HashMap<usize, Arc<DocIntelResponse>>>,
    entities: Mutex<Vec<CloudEntity>>,
}

impl CloudExtractor {
    pub fn new(client: Arc<DocIntelClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
            entities: Mutex::new(Vec::new()),
        }
    }

    /// Entities accumulated across analyzed chunks, for the validator.
    pub async fn collected_entities(&self) -> Vec<CloudEntity> {
        self.entities.lock().await.clone()
    }

    async fn chunk_analysis(
        &self,
        chunk: &DocumentChunk,
    ) -> Result<Arc<DocIntelResponse>, PipelineError> {
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&chunk.index) {
                return Ok(hit.clone());
            }
        }

        let bytes = chunk.to_bytes()?;
        let response = self.client.analyze(&bytes, "application/pdf").await?;
        if !response.entities.is_empty() {
            self.entities
                .lock()
                .await
                .extend(response.entities.iter().cloned());
        }
        let response = Arc::new(response);
        self.cache
            .lock()
            .await
            .insert(chunk.index, response.clone());
        Ok(response)
    }
}

#[async_trait]
impl TextExtractor for CloudExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::CloudIntel
    }

    async fn extract_page(
        &self,
        chunk: &DocumentChunk,
        page: u32,
    ) -> Result<String, PipelineError> {
        let analysis = self.chunk_analysis(chunk).await?;

        // The service numbers pages within the uploaded chunk.
        let local_page = page - chunk.page_start + 1;
        let found = analysis
            .pages
            .iter()
            .find(|p| p.page == local_page)
            .map(|p| p.text.clone());

        match found {
            Some(text) => Ok(text),
            None => {
                warn!(page, chunk = chunk.index, "doc-intel returned no text for page");
                Err(PipelineError::Extraction(format!(
                    "doc-intel missing page {page}"
                )))
            }
        }
    }
}
