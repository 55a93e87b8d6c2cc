//! Source feed abstraction
//!
//! The poller reads from a [`SourceFeed`]; the feed decides which
//! authored items are eligible for syndication (top-level posts and
//! self-replies, typically) and returns them already normalized.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::types::SourceItem;

pub mod jsonl;
pub mod mock;

pub use jsonl::JsonlFeed;
pub use mock::MockFeed;

#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Most recent eligible items, newest first or not; the poller
    /// re-sorts by creation time before ingesting.
    async fn fetch_recent(&self, limit: u32) -> Result<Vec<SourceItem>>;

    /// Ids of every eligible item currently live at the source, for
    /// deletion reconciliation.
    async fn fetch_all_live_ids(&self) -> Result<HashSet<String>>;
}
