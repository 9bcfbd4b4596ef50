use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use json_outbox::config;
use json_outbox::db::{DurableStore, SqliteStore};
use json_outbox::model::ContextId;
use json_outbox::notifier::{ChannelBroadcast, DeliveryNotifier, NotifyMode};
use json_outbox::scheduler::Scheduler;
use json_outbox::transport::HttpTransport;
use json_outbox::SyncAgent;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Background sync agent: drains the JSON outbox whenever it is woken"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let store = SqliteStore::new(cfg.database_url());
    store
        .open()
        .await
        .with_context(|| format!("cannot open outbox store at {}", store.url()))?;
    let transport = HttpTransport::from_config(&cfg)?;

    let notifier = DeliveryNotifier::new(
        Arc::new(ChannelBroadcast::new()),
        NotifyMode::Direct,
        ContextId::new(),
    )
    .with_topics(cfg.outbox.message_type.clone(), cfg.outbox.broadcast_key.clone());
    let scheduler = Scheduler::new(true);
    let (agent, handle) = SyncAgent::new(
        Arc::new(store),
        Arc::new(transport),
        notifier,
        scheduler,
        cfg.outbox.sync_tag.clone(),
    );
    let worker = tokio::spawn(agent.run());

    info!(interval_ms = cfg.app.poll_interval_ms, "sync agent started");
    let mut ticker = tokio::time::interval(cfg.poll_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !handle.post_message(&cfg.outbox.sync_tag) {
                    warn!("sync agent stopped unexpectedly");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    drop(handle);
    worker.await?;
    Ok(())
}
