//! Job dispatch state machine
//!
//! The dispatcher drains the durable queue one target at a time. Each
//! job attempt ends in exactly one [`DispatchOutcome`]: success,
//! dependency wait, rate-limit deferral, budget deferral, permanent
//! rejection, or a retryable transient failure. Deferrals never burn
//! an attempt; only real failures do.
//!
//! Idempotency keys make enqueueing safe to repeat. A deferral
//! re-enqueues the same work under a derived key (day-bucketed for
//! budgets, minute-bucketed for rate limits) and drops the original
//! row, so each deferral cause produces at most one pending job.

use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::error::{PublishError, Result};
use crate::ledger::{JobStats, Ledger};
use crate::resolver::{self, Resolution};
use crate::targets::Publisher;
use crate::types::{DispatchOutcome, Job, JobAction, JobState, SourceItem};

/// Floor on rate-limit deferrals when the target gives no usable hint.
const RATE_LIMIT_FLOOR_SECS: i64 = 60;
/// Idle sleep between queue polls in a worker loop.
const WORKER_IDLE_SLEEP: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct Dispatcher {
    ledger: Ledger,
}

/// Stable key for one (target, item) unit of work. Deferral re-queues
/// derive suffixed keys from this base.
pub fn idempotency_key(target: &str, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update(b"\0");
    hasher.update(source_id.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// UTC calendar day for a timestamp, the budget counter bucket.
pub fn day_key(ts: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts.div_euclid(86_400).to_string())
}

/// Start of the next UTC day after `ts`.
pub fn next_utc_midnight(ts: i64) -> i64 {
    (ts.div_euclid(86_400) + 1) * 86_400
}

impl Dispatcher {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Enqueue a publish job per target. Returns how many rows were
    /// actually inserted; duplicates collapse on the idempotency key.
    pub async fn enqueue_publish(&self, item: &SourceItem, targets: &[String]) -> Result<usize> {
        let mut inserted = 0;
        for target in targets {
            let job = Job {
                idempotency_key: idempotency_key(target, &item.id),
                target: target.clone(),
                action: JobAction::Publish,
                source_id: item.id.clone(),
                payload: Some(item.clone()),
                not_before: 0,
                attempts: 0,
                state: JobState::Pending,
            };
            if self.ledger.enqueue_job(&job).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Enqueue delete jobs, but only toward targets that actually hold
    /// remote ids for this item. Targets that never successfully
    /// published get nothing to do.
    pub async fn enqueue_deletes(&self, source_id: &str) -> Result<usize> {
        let targets = self.ledger.targets_with_remote_ids(source_id).await?;
        let mut inserted = 0;
        for target in targets {
            let job = Job {
                idempotency_key: format!("{}:del", idempotency_key(&target, source_id)),
                target,
                action: JobAction::Delete,
                source_id: source_id.to_string(),
                payload: None,
                not_before: 0,
                attempts: 0,
                state: JobState::Pending,
            };
            if self.ledger.enqueue_job(&job).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Per-state job counts across all targets.
    pub async fn stats(&self) -> Result<JobStats> {
        self.ledger.job_stats().await
    }

    pub async fn dispatch_job(
        &self,
        job: &Job,
        cfg: &TargetConfig,
        publisher: &dyn Publisher,
    ) -> Result<DispatchOutcome> {
        match job.action {
            JobAction::Publish => self.dispatch_publish(job, cfg, publisher).await,
            JobAction::Delete => self.dispatch_delete(job, cfg, publisher).await,
        }
    }

    async fn dispatch_publish(
        &self,
        job: &Job,
        cfg: &TargetConfig,
        publisher: &dyn Publisher,
    ) -> Result<DispatchOutcome> {
        let now = chrono::Utc::now().timestamp();

        // A crash between the wire call and job completion leaves a
        // pending job whose ledger record is already success. Complete
        // it without touching the wire again.
        if self
            .ledger
            .targets_with_remote_ids(&job.source_id)
            .await?
            .contains(&job.target)
        {
            let segments = self
                .ledger
                .get_remote_ids(&job.source_id, &job.target)
                .await?
                .len() as u32;
            self.ledger
                .complete_job(&job.idempotency_key, JobState::Success)
                .await?;
            return Ok(DispatchOutcome::Success { segments });
        }

        let Some(item) = &job.payload else {
            let msg = "publish job has no payload";
            self.ledger
                .record_failure(&job.source_id, &job.target, msg)
                .await?;
            self.ledger
                .complete_job(&job.idempotency_key, JobState::Failed)
                .await?;
            return Ok(DispatchOutcome::PermanentRejection {
                error: msg.to_string(),
            });
        };

        let reply_to = match resolver::resolve(&self.ledger, item, &job.target).await? {
            Resolution::Postable { reply_to } => reply_to,
            Resolution::NotReady => {
                let attempts = self.ledger.bump_attempts(&job.idempotency_key).await?;
                if attempts >= cfg.max_attempts {
                    let msg = "reply parent never published on this target";
                    warn!(source_id = %job.source_id, target = %job.target, "{msg}");
                    self.ledger
                        .record_failure(&job.source_id, &job.target, msg)
                        .await?;
                    self.ledger
                        .complete_job(&job.idempotency_key, JobState::Failed)
                        .await?;
                    return Ok(DispatchOutcome::PermanentRejection {
                        error: msg.to_string(),
                    });
                }
                self.ledger
                    .defer_job(&job.idempotency_key, now + backoff_secs(cfg, attempts))
                    .await?;
                debug!(source_id = %job.source_id, target = %job.target, attempts, "reply dependency not ready");
                return Ok(DispatchOutcome::DependencyNotReady);
            }
        };

        let text = resolver::compose_text(&self.ledger, item, &job.target).await?;
        let segments = cfg.segment(&text);

        // Budget gate. Exceeding the daily cap is a scheduling matter,
        // not an item failure: the whole job moves to the next UTC day
        // and the ledger records nothing.
        if let Some(limit) = cfg.daily_limit {
            let day = day_key(now);
            let used = self.ledger.get_count(&job.target, &day).await?;
            if used as usize + segments.len() > limit as usize {
                let resume_at = next_utc_midnight(now);
                return self
                    .requeue_deferred(job, &format!("b{}", day_key(resume_at)), resume_at)
                    .await
                    .map(|_| {
                        info!(
                            source_id = %job.source_id,
                            target = %job.target,
                            used, limit, %resume_at,
                            "daily budget reached, deferring to next day"
                        );
                        DispatchOutcome::BudgetExceeded { resume_at }
                    });
            }
        }

        match publisher.publish(item, &segments, reply_to.as_deref()).await {
            Ok(receipt) => {
                if cfg.daily_limit.is_some() {
                    self.ledger
                        .increment_count(&job.target, &day_key(now), receipt.remote_ids.len() as u32)
                        .await?;
                }
                self.ledger
                    .record_success(
                        &job.source_id,
                        &job.target,
                        &receipt.remote_ids,
                        receipt.url.as_deref(),
                    )
                    .await?;
                self.ledger
                    .complete_job(&job.idempotency_key, JobState::Success)
                    .await?;
                info!(
                    source_id = %job.source_id,
                    target = %job.target,
                    segments = receipt.remote_ids.len(),
                    "published"
                );
                Ok(DispatchOutcome::Success {
                    segments: receipt.remote_ids.len() as u32,
                })
            }
            Err(error) => self.handle_publish_error(job, cfg, error, now).await,
        }
    }

    async fn dispatch_delete(
        &self,
        job: &Job,
        cfg: &TargetConfig,
        publisher: &dyn Publisher,
    ) -> Result<DispatchOutcome> {
        let now = chrono::Utc::now().timestamp();

        let remote_ids = self
            .ledger
            .get_remote_ids(&job.source_id, &job.target)
            .await?;
        if remote_ids.is_empty() {
            self.ledger
                .complete_job(&job.idempotency_key, JobState::Success)
                .await?;
            return Ok(DispatchOutcome::Success { segments: 0 });
        }

        for remote_id in &remote_ids {
            match publisher.delete(remote_id).await {
                Ok(()) => {}
                // Already gone counts as done
                Err(PublishError::Http { status: 404, .. })
                | Err(PublishError::Http { status: 410, .. }) => {
                    debug!(%remote_id, target = %job.target, "already deleted remotely");
                }
                Err(error) => return self.handle_publish_error(job, cfg, error, now).await,
            }
        }

        self.ledger
            .record_deletion(&job.source_id, &job.target)
            .await?;
        self.ledger
            .complete_job(&job.idempotency_key, JobState::Success)
            .await?;
        info!(source_id = %job.source_id, target = %job.target, count = remote_ids.len(), "deleted remotely");
        Ok(DispatchOutcome::Success {
            segments: remote_ids.len() as u32,
        })
    }

    /// Classify a wire error into the retry behavior for this job.
    async fn handle_publish_error(
        &self,
        job: &Job,
        cfg: &TargetConfig,
        error: PublishError,
        now: i64,
    ) -> Result<DispatchOutcome> {
        match &error {
            PublishError::RateLimited {
                retry_after_secs,
                reset_at,
                ..
            } => {
                let retry_at = rate_limit_retry_at(now, *retry_after_secs, *reset_at);
                self.requeue_rate_limited(job, retry_at).await
            }
            PublishError::Http { status: 429, .. } => {
                let retry_at = rate_limit_retry_at(now, None, None);
                self.requeue_rate_limited(job, retry_at).await
            }
            PublishError::Auth(_) | PublishError::Http { status: 400..=499, .. } => {
                warn!(source_id = %job.source_id, target = %job.target, %error, "permanent rejection");
                self.ledger
                    .record_failure(&job.source_id, &job.target, &error.to_string())
                    .await?;
                self.ledger
                    .complete_job(&job.idempotency_key, JobState::Failed)
                    .await?;
                Ok(DispatchOutcome::PermanentRejection {
                    error: error.to_string(),
                })
            }
            _ => {
                let attempts = self.ledger.bump_attempts(&job.idempotency_key).await?;
                if attempts >= cfg.max_attempts {
                    warn!(
                        source_id = %job.source_id,
                        target = %job.target,
                        attempts, %error,
                        "giving up after repeated transient failures"
                    );
                    self.ledger
                        .record_failure(&job.source_id, &job.target, &error.to_string())
                        .await?;
                    self.ledger
                        .complete_job(&job.idempotency_key, JobState::Failed)
                        .await?;
                } else {
                    let delay = backoff_secs(cfg, attempts);
                    debug!(
                        source_id = %job.source_id,
                        target = %job.target,
                        attempts, delay, %error,
                        "transient failure, backing off"
                    );
                    self.ledger
                        .defer_job(&job.idempotency_key, now + delay)
                        .await?;
                }
                Ok(DispatchOutcome::TransientFailure {
                    error: error.to_string(),
                })
            }
        }
    }

    async fn requeue_rate_limited(&self, job: &Job, retry_at: i64) -> Result<DispatchOutcome> {
        info!(source_id = %job.source_id, target = %job.target, %retry_at, "rate limited, re-queueing");
        self.requeue_deferred(job, &format!("rl{}", retry_at.div_euclid(60)), retry_at)
            .await?;
        Ok(DispatchOutcome::RateLimited { retry_at })
    }

    /// Re-enqueue `job` under a derived key with a future `not_before`
    /// and drop the original row. The derived key makes repeated
    /// deferrals for the same cause collapse to one pending job, while
    /// the terminal row of the original key (if any) cannot shadow the
    /// re-queued work.
    async fn requeue_deferred(&self, job: &Job, bucket: &str, not_before: i64) -> Result<()> {
        let derived = Job {
            idempotency_key: format!("{}:{}", job.idempotency_key, bucket),
            not_before,
            attempts: job.attempts,
            ..job.clone()
        };
        self.ledger.enqueue_job(&derived).await?;
        self.ledger.remove_job(&job.idempotency_key).await?;
        Ok(())
    }

    /// Drain loop for one target. Pacing targets (concurrency 1) space
    /// jobs by `min_interval_secs`; others dispatch a batch at a time.
    pub async fn run_worker(
        &self,
        cfg: TargetConfig,
        publisher: Arc<dyn Publisher>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let batch = cfg.concurrency.max(1);
        info!(target_name = %cfg.name, concurrency = batch, "worker started");

        while !shutdown.load(Ordering::Relaxed) {
            let now = chrono::Utc::now().timestamp();
            // A transient store error must not kill the worker; the
            // queue is durable, so retry after the idle sleep.
            let jobs = match self.ledger.due_jobs(&cfg.name, now, batch).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(target_name = %cfg.name, error = %e, "queue poll failed");
                    tokio::time::sleep(WORKER_IDLE_SLEEP).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::time::sleep(WORKER_IDLE_SLEEP).await;
                continue;
            }

            if batch == 1 {
                for job in &jobs {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = self.dispatch_job(job, &cfg, publisher.as_ref()).await {
                        warn!(target_name = %cfg.name, error = %e, "dispatch failed");
                    }
                    if cfg.min_interval_secs > 0 {
                        tokio::time::sleep(Duration::from_secs(cfg.min_interval_secs)).await;
                    }
                }
            } else {
                let results = futures::future::join_all(
                    jobs.iter()
                        .map(|job| self.dispatch_job(job, &cfg, publisher.as_ref())),
                )
                .await;
                for result in results {
                    if let Err(e) = result {
                        warn!(target_name = %cfg.name, error = %e, "dispatch failed");
                    }
                }
            }
        }

        info!(target_name = %cfg.name, "worker stopped");
        Ok(())
    }
}

/// Exponential backoff with a little jitter so retries spread out.
fn backoff_secs(cfg: &TargetConfig, attempts: u32) -> i64 {
    let base = cfg.backoff_base_secs.max(1);
    let exp = base.saturating_mul(1u64 << attempts.saturating_sub(1).min(16));
    let jitter = rand::thread_rng().gen_range(0..=base);
    (exp + jitter) as i64
}

fn rate_limit_retry_at(now: i64, retry_after_secs: Option<u64>, reset_at: Option<i64>) -> i64 {
    let mut retry_at = now + RATE_LIMIT_FLOOR_SECS;
    if let Some(secs) = retry_after_secs {
        retry_at = retry_at.max(now + secs as i64);
    }
    if let Some(reset) = reset_at {
        retry_at = retry_at.max(reset);
    }
    retry_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CountRule, TargetConfig};
    use crate::targets::MockPublisher;
    use crate::types::ReplyRef;

    fn target_cfg(name: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            max_length: 280,
            counting: CountRule::Graphemes,
            concurrency: 1,
            min_interval_secs: 0,
            daily_limit: None,
            max_attempts: 3,
            backoff_base_secs: 5,
        }
    }

    async fn setup() -> (Ledger, Dispatcher, MockPublisher) {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(ledger.clone());
        (ledger, dispatcher, MockPublisher::new("shortform"))
    }

    async fn enqueue_one(
        dispatcher: &Dispatcher,
        ledger: &Ledger,
        item: &SourceItem,
        target: &str,
    ) -> Job {
        dispatcher
            .enqueue_publish(item, &[target.to_string()])
            .await
            .unwrap();
        ledger
            .due_jobs(target, i64::MAX, 1)
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_success_records_and_completes() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");
        let item = SourceItem::new("item-1", "hello world");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 1 });

        let ids = ledger.get_remote_ids("item-1", "shortform").await.unwrap();
        assert_eq!(ids, vec!["shortform-1"]);
        assert_eq!(ledger.job_stats().await.unwrap().success, 1);
    }

    #[tokio::test]
    async fn test_long_text_is_threaded() {
        let (ledger, dispatcher, publisher) = setup().await;
        let mut cfg = target_cfg("shortform");
        cfg.max_length = 60;
        let text = "one two three four five six seven eight nine ten ".repeat(4);
        let item = SourceItem::new("item-1", text.trim());
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        let DispatchOutcome::Success { segments } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(segments >= 2);

        let published = publisher.published();
        assert_eq!(published[0].segments.len() as u32, segments);
        assert_eq!(
            ledger.get_remote_ids("item-1", "shortform").await.unwrap().len() as u32,
            segments
        );
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_collapses() {
        let (ledger, dispatcher, _publisher) = setup().await;
        let item = SourceItem::new("item-1", "hello");

        let first = dispatcher
            .enqueue_publish(&item, &["shortform".to_string(), "fediverse".to_string()])
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = dispatcher
            .enqueue_publish(&item, &["shortform".to_string(), "fediverse".to_string()])
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(ledger.job_stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_already_published_job_completes_without_wire_call() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");
        let item = SourceItem::new("item-1", "hello");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        ledger
            .record_success("item-1", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 1 });
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_reply_defers_until_parent_published() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        let mut reply = SourceItem::new("item-2", "the reply");
        reply.reply = Some(ReplyRef {
            root_id: "item-1".to_string(),
            parent_id: "item-1".to_string(),
        });
        let job = enqueue_one(&dispatcher, &ledger, &reply, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DependencyNotReady);
        assert!(publisher.published().is_empty());

        // Job is still pending, just pushed into the future
        let deferred = ledger.get_job(&job.idempotency_key).await.unwrap().unwrap();
        assert_eq!(deferred.state, JobState::Pending);
        assert!(deferred.not_before > 0);
        assert_eq!(deferred.attempts, 1);

        // Parent lands; the reply now goes out threaded under it
        ledger
            .record_success("item-1", "shortform", &["parent-remote".to_string()], None)
            .await
            .unwrap();
        let outcome = dispatcher.dispatch_job(&deferred, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 1 });
        assert_eq!(
            publisher.published()[0].reply_to,
            Some("parent-remote".to_string())
        );
    }

    #[tokio::test]
    async fn test_reply_gives_up_at_attempt_cap() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        let mut reply = SourceItem::new("item-2", "orphan reply");
        reply.reply = Some(ReplyRef {
            root_id: "item-1".to_string(),
            parent_id: "item-1".to_string(),
        });
        let job = enqueue_one(&dispatcher, &ledger, &reply, "shortform").await;

        for _ in 0..cfg.max_attempts - 1 {
            let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::DependencyNotReady);
        }
        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::PermanentRejection { .. }));
        assert_eq!(ledger.job_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_budget_exceeded_defers_to_next_day() {
        let (ledger, dispatcher, publisher) = setup().await;
        let mut cfg = target_cfg("shortform");
        cfg.daily_limit = Some(2);

        let now = chrono::Utc::now().timestamp();
        ledger
            .increment_count("shortform", &day_key(now), 2)
            .await
            .unwrap();

        let item = SourceItem::new("item-1", "would exceed the cap");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        let DispatchOutcome::BudgetExceeded { resume_at } = outcome else {
            panic!("expected budget deferral, got {outcome:?}");
        };
        assert_eq!(resume_at, next_utc_midnight(now));

        // Nothing hit the wire, nothing recorded against the item
        assert!(publisher.published().is_empty());
        assert!(ledger.get_remote_ids("item-1", "shortform").await.unwrap().is_empty());

        // Original row replaced by one derived pending job for the day
        assert!(ledger.get_job(&job.idempotency_key).await.unwrap().is_none());
        let stats = ledger.job_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
        assert!(ledger.due_jobs("shortform", now, 10).await.unwrap().is_empty());

        // Re-dispatching the same cause collapses onto the same derived key
        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::BudgetExceeded { .. }));
        assert_eq!(ledger.job_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_success_increments_budget_counter() {
        let (ledger, dispatcher, publisher) = setup().await;
        let mut cfg = target_cfg("shortform");
        cfg.daily_limit = Some(10);

        let item = SourceItem::new("item-1", "counted post");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;
        dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();

        let day = day_key(chrono::Utc::now().timestamp());
        assert_eq!(ledger.get_count("shortform", &day).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_requeues_with_hint() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");
        let now = chrono::Utc::now().timestamp();

        publisher.push_error(PublishError::RateLimited {
            message: "slow down".to_string(),
            retry_after_secs: Some(300),
            reset_at: None,
        });

        let item = SourceItem::new("item-1", "rate limited");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        let DispatchOutcome::RateLimited { retry_at } = outcome else {
            panic!("expected rate limit, got {outcome:?}");
        };
        assert!(retry_at >= now + 300);

        assert!(ledger.get_job(&job.idempotency_key).await.unwrap().is_none());
        let stats = ledger.job_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert!(ledger.due_jobs("shortform", now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_without_hint_uses_floor() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");
        let now = chrono::Utc::now().timestamp();

        publisher.push_error(PublishError::Http {
            status: 429,
            message: "too many requests".to_string(),
        });

        let item = SourceItem::new("item-1", "rate limited");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        let DispatchOutcome::RateLimited { retry_at } = outcome else {
            panic!("expected rate limit, got {outcome:?}");
        };
        assert!(retry_at >= now + RATE_LIMIT_FLOOR_SECS);
    }

    #[tokio::test]
    async fn test_permanent_rejection_on_client_error() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        publisher.push_error(PublishError::Http {
            status: 422,
            message: "text rejected".to_string(),
        });

        let item = SourceItem::new("item-1", "rejected post");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::PermanentRejection { .. }));
        assert_eq!(ledger.job_stats().await.unwrap().failed, 1);

        // No retry: the queue is drained for this target
        assert!(ledger
            .due_jobs("shortform", i64::MAX, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_gives_up() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        let item = SourceItem::new("item-1", "flaky network");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        for attempt in 1..=cfg.max_attempts {
            publisher.push_error(PublishError::Network("timeout".to_string()));
            let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
            assert!(matches!(outcome, DispatchOutcome::TransientFailure { .. }));

            let stored = ledger.get_job(&job.idempotency_key).await.unwrap().unwrap();
            assert_eq!(stored.attempts, attempt);
            if attempt < cfg.max_attempts {
                assert_eq!(stored.state, JobState::Pending);
                assert!(stored.not_before > 0);
            } else {
                assert_eq!(stored.state, JobState::Failed);
            }
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        publisher.push_error(PublishError::Http {
            status: 503,
            message: "unavailable".to_string(),
        });

        let item = SourceItem::new("item-1", "try again later");
        let job = enqueue_one(&dispatcher, &ledger, &item, "shortform").await;

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::TransientFailure { .. }));
        assert_eq!(ledger.job_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_enqueue_deletes_only_targets_with_ids() {
        let (ledger, dispatcher, _publisher) = setup().await;

        ledger
            .record_success("item-1", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();
        ledger
            .record_failure("item-1", "fediverse", "never made it")
            .await
            .unwrap();

        let inserted = dispatcher.enqueue_deletes("item-1").await.unwrap();
        assert_eq!(inserted, 1);

        let due = ledger.due_jobs("shortform", i64::MAX, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].action, JobAction::Delete);
        assert!(ledger.due_jobs("fediverse", i64::MAX, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_every_segment() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        ledger
            .record_success(
                "item-1",
                "shortform",
                &["r1".to_string(), "r2".to_string()],
                None,
            )
            .await
            .unwrap();
        dispatcher.enqueue_deletes("item-1").await.unwrap();
        let job = ledger.due_jobs("shortform", i64::MAX, 1).await.unwrap().pop().unwrap();

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 2 });
        assert_eq!(publisher.deleted(), vec!["r1", "r2"]);

        // Record flipped to deleted; replies can no longer thread on it
        assert!(ledger.get_remote_ids("item-1", "shortform").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_remote_ids_skips_publisher() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        // A prior deletion already cleared the record for this target
        ledger
            .record_success("item-1", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();
        ledger.record_deletion("item-1", "shortform").await.unwrap();

        let job = Job {
            idempotency_key: "del-key".to_string(),
            target: "shortform".to_string(),
            action: JobAction::Delete,
            source_id: "item-1".to_string(),
            payload: None,
            not_before: 0,
            attempts: 0,
            state: JobState::Pending,
        };
        ledger.enqueue_job(&job).await.unwrap();

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 0 });
        assert!(publisher.deleted().is_empty());
        assert_eq!(ledger.job_stats().await.unwrap().success, 1);
    }

    #[tokio::test]
    async fn test_worker_survives_queue_errors() {
        let (ledger, dispatcher, publisher) = setup().await;
        // Pause only after setup: opening the sqlite pool on a blocking
        // thread under paused time auto-advances past the acquire timeout.
        tokio::time::pause();
        // Force every queue poll to fail
        ledger.close().await;

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let flag = Arc::clone(&shutdown);
            async move {
                dispatcher
                    .run_worker(target_cfg("shortform"), Arc::new(publisher), flag)
                    .await
            }
        });

        // Several failed polls go by; the worker keeps looping until
        // told to stop instead of exiting on the first error
        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.store(true, Ordering::Relaxed);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_delete_already_gone_is_success() {
        let (ledger, dispatcher, publisher) = setup().await;
        let cfg = target_cfg("shortform");

        ledger
            .record_success("item-1", "shortform", &["r1".to_string()], None)
            .await
            .unwrap();
        publisher.push_error(PublishError::Http {
            status: 404,
            message: "not found".to_string(),
        });

        dispatcher.enqueue_deletes("item-1").await.unwrap();
        let job = ledger.due_jobs("shortform", i64::MAX, 1).await.unwrap().pop().unwrap();

        let outcome = dispatcher.dispatch_job(&job, &cfg, &publisher).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Success { segments: 1 });
        assert_eq!(ledger.job_stats().await.unwrap().success, 1);
    }

    #[tokio::test]
    async fn test_day_key_and_midnight() {
        // 2026-08-28 12:00:00 UTC
        let ts = 1_787_918_400;
        assert_eq!(day_key(ts), "2026-08-28");
        let midnight = next_utc_midnight(ts);
        assert_eq!(midnight % 86_400, 0);
        assert!(midnight > ts && midnight - ts <= 86_400);
        assert_eq!(day_key(midnight), "2026-08-29");
    }

    #[tokio::test]
    async fn test_idempotency_key_is_stable_and_distinct() {
        let a = idempotency_key("shortform", "item-1");
        assert_eq!(a, idempotency_key("shortform", "item-1"));
        assert_ne!(a, idempotency_key("fediverse", "item-1"));
        assert_ne!(a, idempotency_key("shortform", "item-2"));
        assert_eq!(a.len(), 64);
    }
}
