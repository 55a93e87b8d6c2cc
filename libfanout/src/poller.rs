//! Source polling and deletion reconciliation
//!
//! Ingestion is oldest-first so reply parents are enqueued before
//! their replies, and jobs are enqueued BEFORE the item is marked
//! seen. A crash between the two re-offers the item on the next poll,
//! where the idempotency key collapses the duplicate; the opposite
//! order could lose the item forever.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::ledger::Ledger;
use crate::source::SourceFeed;

pub struct Poller {
    ledger: Ledger,
    dispatcher: Dispatcher,
    feed: Arc<dyn SourceFeed>,
    targets: Vec<String>,
    fetch_limit: u32,
    // Suppresses overlapping polls when a pass runs long
    poll_lock: Mutex<()>,
}

impl Poller {
    pub fn new(
        ledger: Ledger,
        dispatcher: Dispatcher,
        feed: Arc<dyn SourceFeed>,
        targets: Vec<String>,
        fetch_limit: u32,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            feed,
            targets,
            fetch_limit,
            poll_lock: Mutex::new(()),
        }
    }

    /// One ingestion pass. Returns how many new items were enqueued.
    pub async fn poll_once(&self) -> Result<usize> {
        let Ok(_guard) = self.poll_lock.try_lock() else {
            debug!("previous poll still running, skipping");
            return Ok(0);
        };

        let mut items = self.feed.fetch_recent(self.fetch_limit).await?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut ingested = 0;
        for item in items {
            if self.ledger.has_seen(&item.id).await? {
                continue;
            }

            let inserted = self.dispatcher.enqueue_publish(&item, &self.targets).await?;
            self.ledger
                .mark_seen(&item.id, &item.content_cid, item.created_at)
                .await?;

            debug!(source_id = %item.id, jobs = inserted, "ingested item");
            ingested += 1;
        }

        if ingested > 0 {
            info!(count = ingested, "ingested new items");
        }
        Ok(ingested)
    }

    /// One reconciliation pass: items we track as active but the source
    /// no longer lists are treated as deleted and their remote copies
    /// are scheduled for removal.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let live = self.feed.fetch_all_live_ids().await?;
        let active = self.ledger.list_active_ids().await?;

        let mut removed = 0;
        for source_id in active.difference(&live) {
            let jobs = self.dispatcher.enqueue_deletes(source_id).await?;
            self.ledger.mark_deleted(source_id).await?;
            warn!(%source_id, delete_jobs = jobs, "source item deleted, propagating");
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockFeed;
    use crate::types::{JobAction, SourceItem};

    async fn setup(feed: MockFeed) -> (Ledger, Poller) {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(ledger.clone());
        let poller = Poller::new(
            ledger.clone(),
            dispatcher,
            Arc::new(feed),
            vec!["shortform".to_string(), "fediverse".to_string()],
            50,
        );
        (ledger, poller)
    }

    fn item_at(id: &str, created_at: i64) -> SourceItem {
        let mut item = SourceItem::new(id, format!("text of {id}"));
        item.created_at = created_at;
        item
    }

    #[tokio::test]
    async fn test_poll_enqueues_oldest_first() {
        let feed = MockFeed::new();
        feed.add(item_at("newer", 200));
        feed.add(item_at("older", 100));
        let (ledger, poller) = setup(feed).await;

        assert_eq!(poller.poll_once().await.unwrap(), 2);

        // Parent-before-reply ordering falls out of creation order
        let due = ledger.due_jobs("shortform", i64::MAX, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|j| j.source_id.as_str()).collect();
        assert_eq!(ids, vec!["older", "newer"]);

        // One job per target
        assert_eq!(ledger.due_jobs("fediverse", i64::MAX, 10).await.unwrap().len(), 2);
        assert!(ledger.has_seen("older").await.unwrap());
    }

    #[tokio::test]
    async fn test_repolling_is_idempotent() {
        let feed = MockFeed::new();
        feed.add(item_at("item-1", 100));
        let (ledger, poller) = setup(feed.clone()).await;

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        feed.add(item_at("item-2", 200));
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(ledger.job_stats().await.unwrap().pending, 4);
    }

    #[tokio::test]
    async fn test_reconcile_propagates_deletions() {
        let feed = MockFeed::new();
        feed.add(item_at("keep", 100));
        feed.add(item_at("drop", 200));
        let (ledger, poller) = setup(feed.clone()).await;

        poller.poll_once().await.unwrap();
        // Simulate a successful publish so there is something to delete
        ledger
            .record_success("drop", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();

        feed.remove("drop");
        assert_eq!(poller.reconcile_once().await.unwrap(), 1);

        let active = ledger.list_active_ids().await.unwrap();
        assert!(active.contains("keep"));
        assert!(!active.contains("drop"));

        let due = ledger.due_jobs("shortform", i64::MAX, 10).await.unwrap();
        assert!(due
            .iter()
            .any(|j| j.action == JobAction::Delete && j.source_id == "drop"));
    }

    #[tokio::test]
    async fn test_reconcile_skips_targets_without_remote_ids() {
        let feed = MockFeed::new();
        feed.add(item_at("drop", 100));
        let (ledger, poller) = setup(feed.clone()).await;

        poller.poll_once().await.unwrap();
        // Never published anywhere; deletion only marks the ledger
        feed.remove("drop");
        assert_eq!(poller.reconcile_once().await.unwrap(), 1);

        let due = ledger.due_jobs("shortform", i64::MAX, 10).await.unwrap();
        assert!(due.iter().all(|j| j.action != JobAction::Delete));
        assert!(!ledger.list_active_ids().await.unwrap().contains("drop"));
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let feed = MockFeed::new();
        feed.add(item_at("drop", 100));
        let (ledger, poller) = setup(feed.clone()).await;

        poller.poll_once().await.unwrap();
        ledger
            .record_success("drop", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();
        feed.remove("drop");

        assert_eq!(poller.reconcile_once().await.unwrap(), 1);
        assert_eq!(poller.reconcile_once().await.unwrap(), 0);
    }
}
