//! fanout-send - Syndication daemon
//!
//! Polls the source feed, ingests new items into the ledger, and fans
//! publish/delete jobs out to every configured target.

use clap::Parser;
use libfanout::source::{JsonlFeed, SourceFeed};
use libfanout::targets::{ConsolePublisher, Publisher};
use libfanout::{Config, FanoutError, Result, Service};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fanout-send")]
#[command(version)]
#[command(about = "Syndication daemon: fans a source feed out to targets")]
#[command(long_about = "\
fanout-send - Syndication daemon

DESCRIPTION:
    fanout-send is a long-running daemon that polls a source feed,
    records new items in a durable ledger, and publishes them to every
    configured target. Long posts are split into numbered threads,
    replies wait for their parent to land on each target, rate limits
    and daily posting budgets defer work instead of dropping it, and
    deletions at the source are propagated to targets that hold copies.

USAGE:
    # Run in foreground (logs to stderr)
    fanout-send --feed ./feed.jsonl

    # Run with custom poll interval
    fanout-send --feed ./feed.jsonl --poll-interval 30

    # Single pass, then exit
    fanout-send --feed ./feed.jsonl --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight jobs)

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location:  ~/.local/share/fanout/fanout.db
    Override the config path with FANOUT_CONFIG.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Authentication error
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Source feed file (one JSON item per line)
    #[arg(long, value_name = "PATH", env = "FANOUT_FEED")]
    feed: PathBuf,

    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Poll once, drain due jobs, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("FANOUT_LOG_LEVEL", "debug");
    }
    libfanout::logging::init_default();

    if let Err(e) = run(cli).await {
        eprintln!("fanout-send: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(interval) = cli.poll_interval {
        config.poll.interval_secs = interval;
    }

    info!("fanout-send daemon starting");

    let feed: Arc<dyn SourceFeed> = Arc::new(JsonlFeed::new(&cli.feed));
    let publishers = build_publishers(&config).await?;
    let service = Service::new(config, feed, publishers).await?;

    if cli.once {
        service.run_once().await?;
        info!("single pass complete, exiting");
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;
        service.run(shutdown).await?;
    }

    info!("fanout-send daemon stopped");
    Ok(())
}

/// Build and initialize one publisher per configured target.
async fn build_publishers(config: &Config) -> Result<HashMap<String, Arc<dyn Publisher>>> {
    let mut publishers: HashMap<String, Arc<dyn Publisher>> = HashMap::new();
    for target in &config.targets {
        let mut publisher = ConsolePublisher::new(&target.name);
        publisher.init().await?;
        publishers.insert(target.name.clone(), Arc::new(publisher));
    }
    Ok(publishers)
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| FanoutError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}
