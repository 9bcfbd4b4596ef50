use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

use json_outbox::config;
use json_outbox::db::SqliteStore;
use json_outbox::fallback::{FileKeyValueStore, FlatList};
use json_outbox::notifier::ChannelBroadcast;
use json_outbox::scheduler::Scheduler;
use json_outbox::transport::HttpTransport;
use json_outbox::{OutboxCoordinator, OutboxEnv};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Submit one JSON body through the outbox, sending it now if possible"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Destination, absolute or relative to transport.base_url
    #[arg(long)]
    endpoint: String,

    /// JSON body; read from --file when absent
    #[arg(long)]
    json: Option<String>,

    /// File holding the JSON body
    #[arg(long)]
    file: Option<PathBuf>,

    /// Only queue the body, in the outbox or else the fallback list, and never
    /// send it from this process; the agent daemon sends it later
    #[arg(long)]
    queue_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let body = match (&args.json, &args.file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, None) => bail!("either --json or --file is required"),
    };
    serde_json::from_str::<serde_json::Value>(&body).context("body is not valid JSON")?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    // A one-shot process has no agent of its own; it sweeps in place.
    let mut allowed = cfg.capabilities.to_capabilities();
    allowed.has_background_agent = false;
    let mut env = OutboxEnv::new(
        Arc::new(HttpTransport::from_config(&cfg)?),
        Arc::new(ChannelBroadcast::new()),
        Scheduler::new(true),
    )
    .with_store(Arc::new(SqliteStore::new(cfg.database_url())))
    .with_fallback(FlatList::with_key(
        Arc::new(FileKeyValueStore::new(cfg.fallback_dir())),
        cfg.outbox.fallback_key.clone(),
    ))
    .with_capabilities(allowed);
    env.sync_tag = cfg.outbox.sync_tag.clone();
    env.message_type = cfg.outbox.message_type.clone();
    env.broadcast_key = cfg.outbox.broadcast_key.clone();

    let coordinator = OutboxCoordinator::new(env);
    coordinator.open().await;

    if args.queue_only {
        let queued = coordinator.queue_json(&args.endpoint, &body).await;
        coordinator.close().await;
        if !queued {
            bail!("submission could not be queued");
        }
        info!("queued; it will be sent by a later sweep");
        return Ok(());
    }

    let (tx, mut rx) = oneshot::channel();
    coordinator
        .post_json_with(&args.endpoint, &body, move |result, status| {
            let _ = tx.send((result, status));
        })
        .await;

    // Without an agent the sweep runs inside post_json, so the callback has
    // already fired if the server answered.
    match rx.try_recv() {
        Ok((result, status)) => {
            info!(status, "delivered");
            if let Some(result) = result {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
        Err(_) => info!("queued; it will be sent by a later sweep"),
    }
    coordinator.close().await;
    Ok(())
}
