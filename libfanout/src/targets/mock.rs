//! Scriptable in-memory publisher for tests
//!
//! Errors queued with [`MockPublisher::push_error`] are replayed in
//! order before any publish succeeds, so retry paths can be driven
//! deterministically.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{PublishError, Result};
use crate::targets::Publisher;
use crate::types::{PublishReceipt, SourceItem};

/// One recorded publish call.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedThread {
    pub source_id: String,
    pub segments: Vec<String>,
    pub reply_to: Option<String>,
    pub remote_ids: Vec<String>,
}

#[derive(Clone)]
pub struct MockPublisher {
    name: String,
    seq: Arc<AtomicU64>,
    errors: Arc<Mutex<VecDeque<PublishError>>>,
    published: Arc<Mutex<Vec<PublishedThread>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl MockPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            published: Arc::new(Mutex::new(Vec::new())),
            deleted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue an error to be returned by the next publish or delete.
    pub fn push_error(&self, error: PublishError) {
        self.errors.lock().unwrap().push_back(error);
    }

    pub fn published(&self) -> Vec<PublishedThread> {
        self.published.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn next_remote_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.name, n)
    }

    fn take_error(&self) -> Option<PublishError> {
        self.errors.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        item: &SourceItem,
        segments: &[String],
        reply_to: Option<&str>,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        if let Some(error) = self.take_error() {
            return Err(error);
        }

        let remote_ids: Vec<String> = segments.iter().map(|_| self.next_remote_id()).collect();
        self.published.lock().unwrap().push(PublishedThread {
            source_id: item.id.clone(),
            segments: segments.to_vec(),
            reply_to: reply_to.map(str::to_string),
            remote_ids: remote_ids.clone(),
        });

        let url = remote_ids
            .first()
            .map(|id| format!("https://{}.example/{}", self.name, id));
        Ok(PublishReceipt { remote_ids, url })
    }

    async fn delete(&self, remote_id: &str) -> std::result::Result<(), PublishError> {
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        self.deleted.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_assigns_sequential_ids() {
        let publisher = MockPublisher::new("shortform");
        let item = SourceItem::new("item-1", "hello");

        let receipt = publisher
            .publish(&item, &["one".to_string(), "two".to_string()], None)
            .await
            .unwrap();
        assert_eq!(receipt.remote_ids, vec!["shortform-1", "shortform-2"]);
        assert_eq!(
            receipt.url,
            Some("https://shortform.example/shortform-1".to_string())
        );

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].segments, vec!["one", "two"]);
        assert_eq!(published[0].reply_to, None);
    }

    #[tokio::test]
    async fn test_scripted_error_is_replayed_once() {
        let publisher = MockPublisher::new("shortform");
        publisher.push_error(PublishError::Network("reset".to_string()));
        let item = SourceItem::new("item-1", "hello");

        let first = publisher.publish(&item, &["x".to_string()], None).await;
        assert!(matches!(first, Err(PublishError::Network(_))));

        let second = publisher.publish(&item, &["x".to_string()], None).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_delete_records_ids() {
        let publisher = MockPublisher::new("shortform");
        publisher.delete("shortform-9").await.unwrap();
        assert_eq!(publisher.deleted(), vec!["shortform-9"]);
    }
}
