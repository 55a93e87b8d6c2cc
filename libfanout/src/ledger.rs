//! Durable state for the delivery pipeline
//!
//! The ledger is the single source of truth for idempotency decisions:
//! which source items have been seen or deleted, the per-(item, target)
//! publish outcome, the daily budget counters, and the durable job
//! queue. Every mutation is a single-row atomic upsert keyed by the
//! natural identity, so concurrent workers need no external locking.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{Job, JobAction, JobState, SourceItem};

/// Publish outcome statuses stored in `publish_records.status`.
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_DELETED: &str = "deleted";

/// Per-state job counts, for queue introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (or create) the ledger at `db_path` and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix; mode=rwc
        // creates the file if it does not exist.
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Source items
    // ------------------------------------------------------------------

    pub async fn has_seen(&self, source_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM source_items WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(row.is_some())
    }

    /// Idempotent upsert. Re-seeing an item clears any prior deletion
    /// marker; the original `seen_at` is preserved.
    pub async fn mark_seen(
        &self,
        source_id: &str,
        content_cid: &str,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_items (id, content_cid, created_at, seen_at, deleted_at)
            VALUES (?, ?, ?, ?, NULL)
            ON CONFLICT(id)
            DO UPDATE SET content_cid = excluded.content_cid, deleted_at = NULL
            "#,
        )
        .bind(source_id)
        .bind(content_cid)
        .bind(created_at)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// No-op for items that were never seen.
    pub async fn mark_deleted(&self, source_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE source_items SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Ids seen and not deleted, for deletion reconciliation.
    pub async fn list_active_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM source_items WHERE deleted_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ------------------------------------------------------------------
    // Publish records
    // ------------------------------------------------------------------

    pub async fn record_success(
        &self,
        source_id: &str,
        target: &str,
        remote_ids: &[String],
        remote_url: Option<&str>,
    ) -> Result<()> {
        debug_assert!(!remote_ids.is_empty(), "success with no remote ids");
        let ids_json =
            serde_json::to_string(remote_ids).map_err(|e| DbError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO publish_records (source_id, target, status, remote_ids, remote_url, error, updated_at)
            VALUES (?, ?, 'success', ?, ?, NULL, ?)
            ON CONFLICT(source_id, target)
            DO UPDATE SET status = 'success',
                          remote_ids = excluded.remote_ids,
                          remote_url = excluded.remote_url,
                          error = NULL,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(target)
        .bind(ids_json)
        .bind(remote_url)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Upsert a failure. Remote ids and url recorded by a prior
    /// success are preserved, not erased.
    pub async fn record_failure(&self, source_id: &str, target: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_records (source_id, target, status, remote_ids, remote_url, error, updated_at)
            VALUES (?, ?, 'failed', '[]', NULL, ?, ?)
            ON CONFLICT(source_id, target)
            DO UPDATE SET status = 'failed',
                          error = excluded.error,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(target)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn record_deletion(&self, source_id: &str, target: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_records (source_id, target, status, remote_ids, remote_url, error, updated_at)
            VALUES (?, ?, 'deleted', '[]', NULL, NULL, ?)
            ON CONFLICT(source_id, target)
            DO UPDATE SET status = 'deleted',
                          error = NULL,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(target)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Ordered remote ids for (item, target); empty if none recorded
    /// or the record is a deletion. First element is the thread root.
    pub async fn get_remote_ids(&self, source_id: &str, target: &str) -> Result<Vec<String>> {
        let row = sqlx::query(
            "SELECT status, remote_ids FROM publish_records WHERE source_id = ? AND target = ?",
        )
        .bind(source_id)
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let status: String = row.get("status");
        if status == STATUS_DELETED {
            return Ok(Vec::new());
        }
        let ids_json: String = row.get("remote_ids");
        serde_json::from_str(&ids_json)
            .map_err(|e| DbError::Corrupt(format!("remote_ids for {source_id}/{target}: {e}")).into())
    }

    /// The thread-root remote id, or None.
    pub async fn get_remote_id(&self, source_id: &str, target: &str) -> Result<Option<String>> {
        Ok(self
            .get_remote_ids(source_id, target)
            .await?
            .into_iter()
            .next())
    }

    pub async fn get_remote_url(&self, source_id: &str, target: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT remote_url FROM publish_records WHERE source_id = ? AND target = ?",
        )
        .bind(source_id)
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.and_then(|r| r.get("remote_url")))
    }

    /// Targets holding a successful publish with remote ids, used to
    /// decide where delete calls are needed.
    pub async fn targets_with_remote_ids(&self, source_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT target FROM publish_records
            WHERE source_id = ? AND status = 'success' AND remote_ids != '[]'
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("target")).collect())
    }

    // ------------------------------------------------------------------
    // Budget counters
    // ------------------------------------------------------------------

    /// Successful sub-posts counted for `day` (0 if no row).
    pub async fn get_count(&self, target: &str, day: &str) -> Result<u32> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT count FROM budget_counters WHERE target = ? AND day = ?",
        )
        .bind(target)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.and_then(|r| r.0).unwrap_or(0) as u32)
    }

    /// Atomic upsert-increment; returns the new count.
    pub async fn increment_count(&self, target: &str, day: &str, by: u32) -> Result<u32> {
        let new_count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO budget_counters (target, day, count)
            VALUES (?, ?, ?)
            ON CONFLICT(target, day)
            DO UPDATE SET count = count + excluded.count
            RETURNING count
            "#,
        )
        .bind(target)
        .bind(day)
        .bind(by as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(new_count as u32)
    }

    // ------------------------------------------------------------------
    // Job queue
    // ------------------------------------------------------------------

    /// Insert a job unless its idempotency key already exists (pending
    /// or terminal). Returns whether a row was inserted.
    pub async fn enqueue_job(&self, job: &Job) -> Result<bool> {
        let payload = match &job.payload {
            Some(item) => Some(
                serde_json::to_string(item).map_err(|e| DbError::Corrupt(e.to_string()))?,
            ),
            None => None,
        };

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (idempotency_key, target, action, source_id, payload, not_before, attempts, state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&job.idempotency_key)
        .bind(&job.target)
        .bind(job.action.as_str())
        .bind(&job.source_id)
        .bind(payload)
        .bind(job.not_before)
        .bind(job.attempts as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending jobs for `target` whose `not_before` has passed, in
    /// enqueue order.
    pub async fn due_jobs(&self, target: &str, now: i64, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT idempotency_key, target, action, source_id, payload, not_before, attempts, state
            FROM jobs
            WHERE target = ? AND state = 'pending' AND not_before <= ?
            ORDER BY rowid
            LIMIT ?
            "#,
        )
        .bind(target)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_job).collect()
    }

    /// Push a pending job's earliest dispatch time out.
    pub async fn defer_job(&self, idempotency_key: &str, not_before: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET not_before = ?, updated_at = ? WHERE idempotency_key = ?",
        )
        .bind(not_before)
        .bind(chrono::Utc::now().timestamp())
        .bind(idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Increment the attempt counter; returns the new count.
    pub async fn bump_attempts(&self, idempotency_key: &str) -> Result<u32> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            UPDATE jobs SET attempts = attempts + 1, updated_at = ?
            WHERE idempotency_key = ?
            RETURNING attempts
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(attempts as u32)
    }

    /// Move a job to a terminal state.
    pub async fn complete_job(&self, idempotency_key: &str, state: JobState) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = ?, updated_at = ? WHERE idempotency_key = ?")
            .bind(state.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(idempotency_key)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Remove a job row outright. Used when a deferral re-enqueues the
    /// same work under a derived key.
    pub async fn remove_job(&self, idempotency_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_job(&self, idempotency_key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, target, action, source_id, payload, not_before, attempts, state
            FROM jobs WHERE idempotency_key = ?
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn job_stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match state.as_str() {
                "pending" => stats.pending = n as u64,
                "success" => stats.success = n as u64,
                "failed" => stats.failed = n as u64,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Prune terminal jobs last touched before `cutoff`.
    pub async fn delete_terminal_jobs_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('success', 'failed') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let action_str: String = row.get("action");
    let action = JobAction::from_str(&action_str)
        .ok_or_else(|| DbError::Corrupt(format!("unknown job action {action_str:?}")))?;
    let state_str: String = row.get("state");
    let state = JobState::from_str(&state_str)
        .ok_or_else(|| DbError::Corrupt(format!("unknown job state {state_str:?}")))?;

    let payload: Option<String> = row.get("payload");
    let payload: Option<SourceItem> = match payload {
        Some(json) => Some(
            serde_json::from_str(&json).map_err(|e| DbError::Corrupt(e.to_string()))?,
        ),
        None => None,
    };

    Ok(Job {
        idempotency_key: row.get("idempotency_key"),
        target: row.get("target"),
        action,
        source_id: row.get("source_id"),
        payload,
        not_before: row.get("not_before"),
        attempts: row.get::<i64, _>("attempts") as u32,
        state,
    })
}
