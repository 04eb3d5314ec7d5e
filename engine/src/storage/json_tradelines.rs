use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    TradelineStorage,
    io::{ensure_parent_dir, load_or_default, write_json_file},
};
use crate::pipeline::types::NormalizedTradeline;

#[derive(Clone, Debug)]
pub struct JsonTradelineStorageConfig {
    pub working_dir: PathBuf,
}

/// JSON-file-backed tradeline store. The whole table lives in memory behind a
/// `RwLock`; mutations flip a dirty flag and `sync_if_dirty` writes the file
/// atomically.
pub struct JsonTradelineStorage {
    file_path: PathBuf,
    data: Arc<RwLock<HashMap<String, NormalizedTradeline>>>,
    dirty: AtomicBool,
}

impl JsonTradelineStorage {
    pub fn new(config: JsonTradelineStorageConfig) -> Self {
        Self {
            file_path: config.working_dir.join("tradelines.json"),
            data: Arc::new(RwLock::new(HashMap::new())),
            dirty: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TradelineStorage for JsonTradelineStorage {
    async fn initialize(&self) -> Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let data: HashMap<String, NormalizedTradeline> = load_or_default(&self.file_path)
            .await
            .with_context(|| format!("failed to load {}", self.file_path.display()))?;
        *self.data.write().await = data;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.sync_if_dirty().await
    }

    async fn get(&self, key: &str) -> Result<Option<NormalizedTradeline>> {
        let guard = self.data.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn put(&self, key: &str, mut record: NormalizedTradeline) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        if record.created_at.is_none() {
            record.created_at = Some(now.clone());
        }
        record.updated_at = Some(now);
        record.id = key.to_string();

        self.data.write().await.insert(key.to_string(), record);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut guard = self.data.write().await;
        let mut removed_any = false;
        for key in keys {
            if guard.remove(key).is_some() {
                removed_any = true;
            }
        }
        if removed_any {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<NormalizedTradeline>> {
        let guard = self.data.read().await;
        let mut rows: Vec<NormalizedTradeline> = guard
            .values()
            .filter(|tl| tl.user_id == user_id)
            .cloned()
            .collect();
        // Stable output order for callers and tests.
        rows.sort_by(|a, b| {
            a.creditor_name
                .cmp(&b.creditor_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn sync_if_dirty(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = {
            let guard = self.data.read().await;
            guard.clone()
        };

        write_json_file(&self.file_path, &snapshot)
            .await
            .with_context(|| format!("failed to write {}", self.file_path.display()))?;
        Ok(())
    }
}
