//! In-memory source feed for tests

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::source::SourceFeed;
use crate::types::SourceItem;

#[derive(Clone, Default)]
pub struct MockFeed {
    items: Arc<Mutex<Vec<SourceItem>>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: SourceItem) {
        self.items.lock().unwrap().push(item);
    }

    /// Simulate a deletion at the source.
    pub fn remove(&self, source_id: &str) {
        self.items.lock().unwrap().retain(|i| i.id != source_id);
    }
}

#[async_trait]
impl SourceFeed for MockFeed {
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<SourceItem>> {
        let items = self.items.lock().unwrap();
        let mut recent: Vec<SourceItem> = items.iter().cloned().collect();
        // Newest first, like a real feed endpoint
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit as usize);
        Ok(recent)
    }

    async fn fetch_all_live_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.id.clone())
            .collect())
    }
}
