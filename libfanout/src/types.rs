//! Core types for Fanout

use serde::{Deserialize, Serialize};

/// One unit from the source feed, normalized at ingestion.
///
/// Immutable once observed; superseded only by a deletion marker in
/// the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceItem {
    /// Globally unique, stable, opaque id.
    pub id: String,
    /// Content hash / version token.
    pub content_cid: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub quote: Option<QuoteRef>,
}

impl SourceItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            content_cid: format!("cid-{id}"),
            id,
            created_at: chrono::Utc::now().timestamp(),
            text: text.into(),
            media: Vec::new(),
            reply: None,
            quote: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
}

/// Reply linkage back into the source stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyRef {
    pub root_id: String,
    pub parent_id: String,
}

/// Quoted source item. Advisory only: quoting never blocks postability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteRef {
    pub id: String,
    pub is_self_quote: bool,
    pub text: String,
    pub created_at: i64,
    /// Canonical link to the quoted post on the source platform, used
    /// as a fallback reference when the quote is not resolvable on the
    /// target.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobAction {
    Publish,
    Delete,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Publish => "publish",
            JobAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(JobAction::Publish),
            "delete" => Some(JobAction::Delete),
            _ => None,
        }
    }
}

/// Durable job states. Deferred and retryable attempts stay `Pending`
/// with a pushed-out `not_before`; only `Success` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Success,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Success => "success",
            JobState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "success" => Some(JobState::Success),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// One unit of dispatch work, persisted in the jobs table.
#[derive(Debug, Clone)]
pub struct Job {
    pub idempotency_key: String,
    pub target: String,
    pub action: JobAction,
    pub source_id: String,
    /// Full item for publish jobs; `None` for deletes.
    pub payload: Option<SourceItem>,
    /// Earliest dispatch time (unix seconds).
    pub not_before: i64,
    pub attempts: u32,
    pub state: JobState,
}

/// What a Publisher returns for a fully posted thread.
///
/// `remote_ids` is never empty on success; the first element is the
/// thread root. A partially posted thread is reported as an error, not
/// a receipt (all-or-nothing recording).
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub remote_ids: Vec<String>,
    pub url: Option<String>,
}

/// Terminal classification of one dispatch attempt. Callers branch on
/// data, not on error downcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Thread fully posted; `segments` sub-posts were written.
    Success { segments: u32 },
    /// Reply parent/root not yet published on this target; retried.
    DependencyNotReady,
    /// Target signalled a rate limit; job deferred to `retry_at`.
    RateLimited { retry_at: i64 },
    /// Daily budget would be exceeded; job deferred to `resume_at`.
    /// Not a failure of the item, only a scheduling deferral.
    BudgetExceeded { resume_at: i64 },
    /// 4xx other than 429: the input was rejected, retrying is futile.
    PermanentRejection { error: String },
    /// Network/5xx/unknown; retried up to the attempt cap.
    TransientFailure { error: String },
}
