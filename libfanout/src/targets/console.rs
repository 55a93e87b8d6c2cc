//! Console publisher
//!
//! Writes threads to stdout instead of a remote service. Useful for
//! dry runs and for exercising the full pipeline without credentials.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::error::{PublishError, Result};
use crate::targets::Publisher;
use crate::types::{PublishReceipt, SourceItem};

pub struct ConsolePublisher {
    name: String,
    seq: AtomicU64,
}

impl ConsolePublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Publisher for ConsolePublisher {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        item: &SourceItem,
        segments: &[String],
        reply_to: Option<&str>,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        let mut remote_ids = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let remote_id = format!("console-{n}");
            println!(
                "[{}] {} ({}/{}): {}",
                self.name,
                item.id,
                i + 1,
                segments.len(),
                segment
            );
            remote_ids.push(remote_id);
        }
        if let Some(parent) = reply_to {
            info!(target_name = %self.name, %parent, "posted as reply");
        }

        Ok(PublishReceipt {
            remote_ids,
            url: None,
        })
    }

    async fn delete(&self, remote_id: &str) -> std::result::Result<(), PublishError> {
        println!("[{}] deleted {}", self.name, remote_id);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
