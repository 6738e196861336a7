//! Pushl main entry point
//!
//! Thin CLI front end: parse flags, seed the engine with the given URLs,
//! wait for the task graph to drain, and exit nonzero if anything failed.

use clap::Parser;
use pushl::config::{
    default_user_agent, ProcessingConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_HOST,
    DEFAULT_TIMEOUT_SECS,
};
use pushl::{normalize_url, Engine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Send push notifications for feed updates
///
/// Fetches the given feeds and entries, then dispatches WebSub hub pings,
/// Webmentions to linked pages, and optional Wayback Machine archival
/// requests for everything that changed since the last run.
#[derive(Parser, Debug)]
#[command(name = "pushl")]
#[command(version)]
#[command(about = "Send push notifications for feed updates", long_about = None)]
struct Cli {
    /// Feed URLs to process
    #[arg(value_name = "FEED_URL")]
    feeds: Vec<String>,

    /// Cache storage directory; omit to disable persistence
    #[arg(short = 'c', long = "cache", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// URLs to process directly as entries rather than feeds
    #[arg(short = 'e', long = "entry", value_name = "ENTRY_URL", num_args = 1..)]
    entries: Vec<String>,

    /// Feeds to only send WebSub notifications for
    #[arg(short = 's', long = "websub-only", value_name = "FEED_URL", num_args = 1..)]
    websub_only: Vec<String>,

    /// Recursively process autodiscovered feeds
    #[arg(short = 'r', long = "recurse")]
    recurse: bool,

    /// Process archive links in feeds per RFC 5005
    #[arg(short = 'a', long = "archive")]
    archive: bool,

    /// Request Wayback Machine archival for every linked target
    #[arg(short = 'k', long = "wayback")]
    wayback: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// User-agent string to send
    #[arg(long = "user-agent", value_name = "STRING")]
    user_agent: Option<String>,

    /// Per-request timeout, in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECONDS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Maximum number of connections open at once
    #[arg(long = "max-connections", value_name = "N", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Maximum number of connections per host (0 = unlimited)
    #[arg(long = "max-per-host", value_name = "N", default_value_t = DEFAULT_MAX_PER_HOST)]
    max_per_host: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    // Configuration problems fail fast, before any task is submitted.
    if let Some(dir) = &cli.cache_dir {
        std::fs::create_dir_all(dir)
            .map_err(|err| format!("cache directory {} is unusable: {err}", dir.display()))?;
    }

    let feeds = parse_seed_urls(&cli.feeds)?;
    let websub_only = parse_seed_urls(&cli.websub_only)?;
    let entries = parse_seed_urls(&cli.entries)?;

    let config = ProcessingConfig {
        cache_dir: cli.cache_dir.clone(),
        recurse: cli.recurse,
        archive: cli.archive,
        wayback: cli.wayback,
        wayback_endpoint: pushl::notify::WAYBACK_SAVE_PREFIX.to_string(),
        websub_only: websub_only.iter().map(|url| url.to_string()).collect(),
        user_agent: cli.user_agent.clone().unwrap_or_else(default_user_agent),
        timeout: Duration::from_secs(cli.timeout),
        max_connections: cli.max_connections,
        max_per_host: cli.max_per_host,
    };

    let engine = Engine::new(config)?;

    // SIGINT stops admission of new tasks; in-flight work drains first.
    {
        let registry = Arc::clone(engine.registry());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                registry.cancel();
            }
        });
    }

    engine.seed(&feeds, &websub_only, &entries);
    engine.registry().await_quiescent().await;

    let failures = engine.registry().failures();
    if engine.registry().is_cancelled() {
        tracing::warn!("Run cancelled; {} task(s) had failed", failures);
        std::process::exit(1);
    }
    if failures > 0 {
        tracing::error!("{} task(s) failed", failures);
        std::process::exit(1);
    }

    tracing::info!("Completed all tasks");
    Ok(())
}

/// Sets up the tracing subscriber based on verbosity level
fn setup_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::new("pushl=warn"),
        1 => EnvFilter::new("pushl=info"),
        2 => EnvFilter::new("pushl=debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Normalizes seed URLs, rejecting the whole invocation on a bad one
fn parse_seed_urls(inputs: &[String]) -> Result<Vec<Url>, Box<dyn std::error::Error>> {
    inputs
        .iter()
        .map(|raw| {
            normalize_url(raw).map_err(|err| format!("invalid URL {raw}: {err}").into())
        })
        .collect()
}
