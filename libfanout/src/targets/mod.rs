//! Target abstraction
//!
//! Each syndication target implements [`Publisher`]. The dispatcher
//! owns segmentation, threading, retry classification, and budget
//! accounting; publishers only move segments over the wire and report
//! structured errors.

use async_trait::async_trait;

use crate::error::{PublishError, Result};
use crate::types::{PublishReceipt, SourceItem};

pub mod console;
pub mod mock;

pub use console::ConsolePublisher;
pub use mock::MockPublisher;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// One-time setup (auth, session). Called before the publisher is
    /// shared across workers.
    async fn init(&mut self) -> Result<()>;

    /// Post `segments` as a thread, each segment replying to the one
    /// before it; the first replies to `reply_to` when given.
    ///
    /// On success every segment was posted and the receipt carries one
    /// remote id per segment, thread root first. Publishers that fail
    /// partway must report an error so the whole thread is retried.
    async fn publish(
        &self,
        item: &SourceItem,
        segments: &[String],
        reply_to: Option<&str>,
    ) -> std::result::Result<PublishReceipt, PublishError>;

    /// Remove a previously published sub-post.
    async fn delete(&self, remote_id: &str) -> std::result::Result<(), PublishError>;

    async fn shutdown(&self) -> Result<()>;

    fn name(&self) -> &str;
}
