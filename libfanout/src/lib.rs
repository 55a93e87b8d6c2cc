//! # libfanout
//!
//! Core library for Fanout, a syndication pipeline that mirrors a
//! single source feed to multiple targets. The pipeline polls the
//! source, records everything it sees in a durable SQLite ledger,
//! splits long posts into length-constrained threads, and dispatches
//! publish and delete jobs per target with idempotency keys, retry
//! backoff, rate-limit deferral, and daily budget accounting.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod poller;
pub mod resolver;
pub mod segmenter;
pub mod service;
pub mod source;
pub mod targets;
pub mod types;

pub use config::{Config, CountRule, TargetConfig};
pub use dispatcher::Dispatcher;
pub use error::{FanoutError, PublishError, Result};
pub use ledger::Ledger;
pub use poller::Poller;
pub use service::Service;
pub use source::SourceFeed;
pub use targets::Publisher;
pub use types::{DispatchOutcome, Job, PublishReceipt, SourceItem};
