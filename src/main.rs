mod committer;
mod config;
mod connection;
mod error;
mod listener;
mod media;
mod model;
mod normalizer;
mod pipeline;
mod query;
mod retry;
mod scheduler;
mod store;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::committer::Committer;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::listener::EventListener;
use crate::media::{spawn_media_pool, MediaFetcher};
use crate::pipeline::{resume_pending, Pipeline};
use crate::scheduler::tasks::register_heartbeat;
use crate::scheduler::Scheduler;
use crate::store::{MessageStore, Storage};
use crate::transport::telegram::{build_bot, TelegramConnector, TelegramMediaSource};
use crate::transport::Credentials;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,channel_ingest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // `channel-ingest [config]` or `channel-ingest query <start> <end> [config]`
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("query") {
        let (Some(start), Some(end)) = (args.get(1), args.get(2)) else {
            anyhow::bail!("usage: channel-ingest query <YYYY-MM-DD> <YYYY-MM-DD> [config]");
        };
        let config = load_config(args.get(3))?;
        return run_query(&config, start, end).await;
    }

    let config = load_config(args.first())?;
    config.validate()?;

    let proxy = config.proxy.validate()?;
    info!("  Channel: {}", config.telegram.channel);
    info!("  Database: {}", config.storage.database_path.display());
    info!("  Media dir: {}", config.storage.media_dir.display());
    info!("  Media workers: {}", config.ingest.media_workers);
    match &proxy {
        Some(proxy) => info!("  Proxy: {}", proxy.url()),
        None => info!("  Proxy: disabled"),
    }

    let store = MessageStore::open(&config.storage.database_path)?;
    let storage: Arc<dyn Storage> = Arc::new(store);
    let committer = Arc::new(Committer::new(
        Arc::clone(&storage),
        (&config.ingest.storage_retry).into(),
    ));

    let credentials = Credentials {
        bot_token: config.telegram.bot_token.clone(),
    };
    let bot = build_bot(&credentials, proxy.as_ref())?;
    let fetcher = Arc::new(MediaFetcher::new(
        Arc::new(TelegramMediaSource::new(bot)),
        config.storage.media_dir.clone(),
        (&config.ingest.download_retry).into(),
    ));

    let shutdown = CancellationToken::new();
    let (media_queue, media_pool) = spawn_media_pool(
        fetcher,
        Arc::clone(&committer),
        config.ingest.media_workers,
        shutdown.clone(),
    );

    // Downloads interrupted by the previous run
    if let Err(e) = resume_pending(storage.as_ref(), &media_queue).await {
        warn!(error = %e, "could not load pending media, they will be retried on next start");
    }

    let mut scheduler = Scheduler::new().await?;
    register_heartbeat(&scheduler, &config.ingest.heartbeat_cron, Arc::clone(&storage)).await?;
    scheduler.start().await?;

    let (events_tx, events_rx) = mpsc::channel(config.ingest.queue_capacity);
    let pipeline = tokio::spawn(Pipeline::new(committer, media_queue).run(events_rx));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    let mut manager = ConnectionManager::new(
        Arc::new(TelegramConnector),
        credentials,
        config.proxy.clone(),
        config.telegram.channel.clone(),
        (&config.ingest.connect_retry).into(),
    );
    let mut listener = EventListener::new(
        &config.telegram.channel,
        events_tx,
        Duration::from_secs(config.ingest.keepalive_secs),
    );

    info!("Ingestion is starting...");
    let listener_token = shutdown.clone();
    let outcome = tokio::spawn(async move {
        manager.maintain(&mut listener, &listener_token).await
    })
    .await;

    // The listener (and its queue sender) is gone; let the pipeline drain.
    if let Err(e) = pipeline.await {
        error!(error = %e, "pipeline task failed");
    }
    shutdown.cancel();
    if let Err(e) = media_pool.await {
        error!(error = %e, "media pool task failed");
    }
    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "scheduler did not stop cleanly");
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Ingestion stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Ingestion stopped on unrecoverable error");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("listener task failed: {}", e)),
    }
}

fn load_config(path: Option<&String>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Configuration loaded successfully");
    Ok(config)
}

/// Print stored messages sent between two days, newest first.
async fn run_query(config: &Config, start: &str, end: &str) -> Result<()> {
    let store = MessageStore::open(&config.storage.database_path)?;
    let messages = query::messages_between(&store, start, end).await?;

    info!(count = messages.len(), start, end, "query finished");
    for record in &messages {
        println!("{}", query::format_row(record));
    }
    Ok(())
}
