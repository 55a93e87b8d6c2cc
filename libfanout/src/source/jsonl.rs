//! File-backed source feed
//!
//! Reads one JSON-encoded item per line. The file is re-read on every
//! poll, so appending a line publishes a new item and removing a line
//! is picked up by the next reconciliation pass.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::{FanoutError, Result};
use crate::source::SourceFeed;
use crate::types::SourceItem;

pub struct JsonlFeed {
    path: PathBuf,
}

impl JsonlFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_items(&self) -> Result<Vec<SourceItem>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FanoutError::InvalidInput(format!("cannot read feed {}: {e}", self.path.display()))
        })?;

        let mut items = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let item: SourceItem = serde_json::from_str(line).map_err(|e| {
                FanoutError::InvalidInput(format!(
                    "bad feed entry at {}:{}: {e}",
                    self.path.display(),
                    lineno + 1
                ))
            })?;
            items.push(item);
        }
        Ok(items)
    }
}

#[async_trait]
impl SourceFeed for JsonlFeed {
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<SourceItem>> {
        let mut items = self.read_items().await?;
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn fetch_all_live_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .read_items()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }
}
