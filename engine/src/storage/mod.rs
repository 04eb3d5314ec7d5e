use anyhow::Result;
use async_trait::async_trait;

pub mod io;
pub mod json_tradelines;

pub use json_tradelines::{JsonTradelineStorage, JsonTradelineStorageConfig};

use crate::pipeline::types::NormalizedTradeline;

/// Persistence boundary for tradeline rows, keyed by deduplication key.
///
/// Key uniqueness is enforced here as the last line of defense; callers are
/// expected to serialize writes per user above this layer.
#[async_trait]
pub trait TradelineStorage: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn finalize(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<NormalizedTradeline>>;

    /// Inserts or replaces the row at `key`. Stamps `updated_at`, and
    /// `created_at` when the row carries none.
    async fn put(&self, key: &str, record: NormalizedTradeline) -> Result<()>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<NormalizedTradeline>>;

    /// Flush pending writes to disk if any happened since the last sync.
    async fn sync_if_dirty(&self) -> Result<()>;
}
