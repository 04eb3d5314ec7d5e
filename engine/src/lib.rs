use std::sync::Arc;

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod storage;

use config::AppConfig;
use pipeline::ReportPipeline;
use storage::TradelineStorage;

/// Shared state behind every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<ReportPipeline>,
    pub storage: Arc<dyn TradelineStorage>,
}
