use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use json_outbox::config;
use json_outbox::db::{DurableStore, SqliteStore};
use json_outbox::fallback::{FileKeyValueStore, FlatList};
use json_outbox::model::{CommitMode, ContextId};
use json_outbox::notifier::{ChannelBroadcast, DeliveryNotifier, NotifyMode};
use json_outbox::scheduler::Scheduler;
use json_outbox::transport::HttpTransport;
use json_outbox::SyncAgent;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Send every pending outbox record and exit when the outbox is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit as soon as a record cannot be sent instead of waiting and retrying
    #[arg(long)]
    skip_failed: bool,

    /// Number of stalled passes tolerated before giving up
    #[arg(long, default_value = "5")]
    max_failed_attempts: u32,

    /// Seconds to wait after a stalled pass
    #[arg(long, default_value = "10")]
    retry_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = Arc::new(SqliteStore::new(cfg.database_url()));
    store
        .open()
        .await
        .with_context(|| format!("cannot open outbox store at {}", store.url()))?;

    // Entries parked while the store was unreachable go first.
    let fallback = FlatList::with_key(
        Arc::new(FileKeyValueStore::new(cfg.fallback_dir())),
        cfg.outbox.fallback_key.clone(),
    );
    let mut unmoved = Vec::new();
    for entry in fallback.take_all()? {
        if let Err(err) = store
            .add(&entry.endpoint, &entry.json_string, CommitMode::Immediate)
            .await
        {
            warn!(?err, endpoint = %entry.endpoint, "cannot move fallback entry; putting it back");
            unmoved.push(entry);
        }
    }
    fallback
        .extend(unmoved)
        .context("cannot restore fallback entries")?;

    let remaining = store.count().await?;
    info!(remaining, "Starting outbox drain");
    if remaining == 0 {
        info!("Outbox is empty, exiting");
        return Ok(());
    }

    let notifier = DeliveryNotifier::new(
        Arc::new(ChannelBroadcast::new()),
        NotifyMode::Direct,
        ContextId::new(),
    );
    let (agent, _handle) = SyncAgent::new(
        store.clone(),
        Arc::new(HttpTransport::from_config(&cfg)?),
        notifier,
        Scheduler::new(true),
        cfg.outbox.sync_tag.clone(),
    );

    let mut delivered = 0;
    let mut rejected = 0;
    let mut stalled_passes = 0;
    loop {
        let report = agent.drain().await?;
        delivered += report.delivered;
        rejected += report.rejected;
        let Some(stalled_id) = report.stalled_on else {
            info!(delivered, rejected, "All outbox records processed");
            break;
        };

        stalled_passes += 1;
        let remaining = store.count().await?;
        warn!(
            stalled_id,
            remaining,
            attempt = stalled_passes,
            "Drain stalled on a record that could not be sent"
        );
        if args.skip_failed {
            warn!("--skip-failed specified, exiting with records remaining");
            break;
        }
        if stalled_passes >= args.max_failed_attempts {
            error!(
                threshold = args.max_failed_attempts,
                "Giving up after repeated failures; records stay queued"
            );
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.retry_delay_secs)).await;
    }

    info!(
        delivered,
        rejected,
        remaining = store.count().await?,
        "Outbox drain finished"
    );
    Ok(())
}
