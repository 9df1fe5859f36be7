//! outboxd binary entry point.
//!
//! Usage: outboxd [--input <file>] [--endpoint <url>]
//!
//! Reads newline-delimited JSON events from stdin (or `--input`), stores them
//! in the durable outbox under `~/.event-outbox/queue` and delivers them to
//! the collector in batches. Events not delivered before exit are sent by the
//! next run.

mod ingest;

use anyhow::Context;
use clap::Parser;
use event_outbox::{open_backend, HttpTransport, OutboxManager, DEFAULT_KEY_PREFIX};
use outbox_config_and_utils::{init_logging, Config, Paths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{debug, error, info, warn};

/// outboxd: durable batch delivery of JSON events.
#[derive(Parser, Debug)]
#[command(name = "outboxd")]
#[command(about = "Forwards newline-delimited JSON events to a collector through the durable outbox")]
struct Args {
    /// File to read events from. Defaults to stdin.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Collector URL. Overrides the config file.
    #[arg(long)]
    endpoint: Option<String>,

    /// Destination name; selects the queue file.
    #[arg(long, default_value = "events")]
    destination: String,

    /// Base directory for config, queue and logs.
    #[arg(long, env = "OUTBOX_HOME")]
    base_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for delivery after the input ends.
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,

    /// Only log to the log file.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let paths = match &args.base_dir {
        Some(dir) => Paths::with_base_dir(dir.clone()),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    let mut config = Config::load(&paths).context("loading configuration")?;
    if let Some(endpoint) = args.endpoint.clone() {
        config.endpoint = endpoint;
    }
    if let Some(level) = args.log_level.clone() {
        config.log_level = level;
    }
    config.validate()?;

    init_logging(&config.log_level, &paths.log_file(), !args.quiet)?;
    info!(
        endpoint = %config.endpoint,
        destination = %args.destination,
        batch_size = config.outbox.batch_size,
        flush_interval_ms = config.outbox.flush_interval_ms,
        "outboxd starting"
    );

    let backend = open_backend(&paths.queue_dir());
    let manager = OutboxManager::new(backend, DEFAULT_KEY_PREFIX, config.outbox.clone());
    let transport = Arc::new(HttpTransport::new(config.endpoint.clone(), config.auth_token.clone())?);
    debug!(endpoint = %transport.endpoint(), authenticated = config.auth_token.is_some(), "Collector transport ready");
    let handle = manager.register(&args.destination, transport, None).await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let run = async {
        let stats = ingest::ingest(reader, &handle).await?;
        info!(
            enqueued = stats.enqueued,
            sent_directly = stats.sent_directly,
            invalid = stats.invalid,
            rejected = stats.rejected,
            "Input finished"
        );
        let limit = Duration::from_secs(args.drain_timeout_secs);
        ingest::drain(&handle, Duration::from_millis(200), limit).await;
        anyhow::Ok(())
    };

    let outcome = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, unloading...");
            Ok(())
        }
    };
    if let Err(e) = &outcome {
        error!(error = %e, "Input failed");
    }

    if !manager.unload_all().await {
        warn!("Some events were not written back; they remain queued as they were");
    }
    info!("outboxd stopped");
    outcome
}
