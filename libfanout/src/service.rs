//! Daemon orchestration
//!
//! Wires the poller, dispatcher, and per-target workers together and
//! runs them until shutdown is requested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{FanoutError, Result};
use crate::ledger::Ledger;
use crate::poller::Poller;
use crate::source::SourceFeed;
use crate::targets::Publisher;

pub struct Service {
    config: Config,
    ledger: Ledger,
    dispatcher: Dispatcher,
    poller: Arc<Poller>,
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl Service {
    /// Build the service. Publishers must already be initialized; a
    /// configured target without a publisher is a config error.
    pub async fn new(
        config: Config,
        feed: Arc<dyn SourceFeed>,
        publishers: HashMap<String, Arc<dyn Publisher>>,
    ) -> Result<Self> {
        for target in &config.targets {
            if !publishers.contains_key(&target.name) {
                return Err(FanoutError::InvalidInput(format!(
                    "no publisher registered for target {:?}",
                    target.name
                )));
            }
        }

        let ledger = Ledger::new(&config.database.path).await?;
        let dispatcher = Dispatcher::new(ledger.clone());
        let targets: Vec<String> = config.targets.iter().map(|t| t.name.clone()).collect();
        let poller = Arc::new(Poller::new(
            ledger.clone(),
            dispatcher.clone(),
            feed,
            targets,
            config.poll.fetch_limit,
        ));

        Ok(Self {
            config,
            ledger,
            dispatcher,
            poller,
            publishers,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run until `shutdown` flips. Spawns one worker per target plus
    /// the poll loop in the current task.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let mut workers = Vec::new();
        for target in &self.config.targets {
            let publisher = Arc::clone(&self.publishers[&target.name]);
            let dispatcher = self.dispatcher.clone();
            let cfg = target.clone();
            let flag = Arc::clone(&shutdown);
            workers.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.run_worker(cfg, publisher, flag).await {
                    error!(error = %e, "worker exited with error");
                }
            }));
        }

        let poll_every = Duration::from_secs(self.config.poll.interval_secs.max(1));
        let reconcile_every =
            Duration::from_secs(self.config.poll.reconcile_interval_secs.max(1));
        let mut last_poll: Option<tokio::time::Instant> = None;
        let mut last_reconcile = tokio::time::Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            let now = tokio::time::Instant::now();

            if last_poll.map_or(true, |at| now.duration_since(at) >= poll_every) {
                if let Err(e) = self.poller.poll_once().await {
                    warn!(error = %e, "poll failed");
                }
                last_poll = Some(now);
            }

            if now.duration_since(last_reconcile) >= reconcile_every {
                if let Err(e) = self.poller.reconcile_once().await {
                    warn!(error = %e, "reconciliation failed");
                }
                last_reconcile = now;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("shutting down, waiting for workers");
        for worker in workers {
            let _ = worker.await;
        }
        for publisher in self.publishers.values() {
            publisher.shutdown().await?;
        }
        self.ledger.close().await;
        Ok(())
    }

    /// Single pass: poll, reconcile, then drain every currently due
    /// job. Used by the `--once` flag and by tests.
    pub async fn run_once(&self) -> Result<()> {
        self.poller.poll_once().await?;
        self.poller.reconcile_once().await?;

        for target in &self.config.targets {
            let publisher = &self.publishers[&target.name];
            loop {
                let now = chrono::Utc::now().timestamp();
                let jobs = self.ledger.due_jobs(&target.name, now, 20).await?;
                if jobs.is_empty() {
                    break;
                }
                for job in &jobs {
                    if let Err(e) = self
                        .dispatcher
                        .dispatch_job(job, target, publisher.as_ref())
                        .await
                    {
                        warn!(target_name = %target.name, error = %e, "dispatch failed");
                    }
                }
            }
        }

        for publisher in self.publishers.values() {
            publisher.shutdown().await?;
        }
        Ok(())
    }
}
