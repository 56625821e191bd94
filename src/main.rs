use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spiderbot_scheduler::{
    config::{Config, StoreBackend},
    job_scheduling::{
        ConsumerPool, ConsumerSettings, CrawlScheduler, HttpExtractionClient, RetentionSweeper,
        TaskProducer,
    },
    store::{InMemoryQueueStore, QueueStore, RedisQueueStore},
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "spiderbot-scheduler")]
#[command(version)]
#[command(about = "Priority crawl queue and recurring crawl scheduler")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Redis URL (overrides config file)
    #[arg(short = 'r', long, value_name = "URL")]
    redis_url: Option<String>,

    /// Store backend: redis or memory
    #[arg(long, value_name = "BACKEND")]
    store: Option<StoreBackend>,

    /// Maximum concurrent extraction dispatches
    #[arg(short = 'm', long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("spiderbot_scheduler={},tower_http=trace", cli.log_level)
    } else {
        format!("spiderbot_scheduler={},tower_http=info", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting spiderbot scheduler v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(redis_url) = cli.redis_url {
        config.store.redis_url = redis_url;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.queue.max_concurrent = max_concurrent;
    }
    config.validate()?;

    let store: Arc<dyn QueueStore> = match config.store.backend {
        StoreBackend::Redis => {
            info!("Using redis store: {}", config.store.redis_url);
            Arc::new(
                RedisQueueStore::connect(&config.store.redis_url, config.store.trigger_key.clone())
                    .await
                    .context("Failed to connect to redis")?,
            )
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; queue state is lost on restart");
            Arc::new(InMemoryQueueStore::new())
        }
    };
    store.ping().await.context("Store did not answer ping")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let producer = TaskProducer::new(store.clone());
    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.queue.name.clone(),
        config.retention.max_age,
        &config.retention.sweep_schedule,
    )?;
    let scheduler = Arc::new(
        CrawlScheduler::new(
            store.clone(),
            producer.clone(),
            config.queue.name.clone(),
            config.queue.default_depth,
        )
        .with_retention(sweeper)
        .with_shutdown(&shutdown),
    );

    // Triggers are recovered before the server accepts requests
    let recovered = scheduler.init().await?;
    info!("Recovered {} recurring triggers", recovered);

    let extractor = Arc::new(HttpExtractionClient::new(
        config.extract_url(),
        config.extraction.timeout,
    )?);
    info!("Dispatching tasks to {}", extractor.endpoint());

    let consumer = Arc::new(ConsumerPool::new(
        store.clone(),
        producer,
        extractor,
        ConsumerSettings::from(&config),
    ));

    let web_server = WebServer::new(
        &config,
        AppState {
            scheduler: scheduler.clone(),
            consumer: consumer.clone(),
            store,
        },
    )?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );

    // Create a channel to signal when the server is ready or fails to bind
    let (server_ready_tx, server_ready_rx) = tokio::sync::oneshot::channel();
    let server_token = shutdown.child_token();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = web_server
            .serve_with_cancellation(server_ready_tx, server_token)
            .await
        {
            error!("Web server failed: {}", e);
        }
    });

    match server_ready_rx.await {
        Ok(Ok(())) => {
            info!("Web server is now listening, starting consumer pool...");
        }
        Ok(Err(bind_error)) => {
            error!("Failed to bind web server: {}", bind_error);
            scheduler.disconnect().await;
            return Err(bind_error);
        }
        Err(_) => {
            error!("Web server task completed without signaling");
            scheduler.disconnect().await;
            return Err(anyhow::anyhow!("Web server failed to start"));
        }
    }

    let consumer_handle = consumer.start(config.queue.max_concurrent, &shutdown);
    info!("All services started successfully");

    server_handle.await?;
    // A server exit without a signal still brings the rest down
    shutdown.cancel();

    if let Some(handle) = consumer_handle {
        handle.await?;
    }
    scheduler.disconnect().await;
    // Last store handles; dropping them closes the store connection
    drop(consumer);
    drop(scheduler);

    info!("Shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                        _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                    }
                }
                _ => {
                    error!("Failed to install signal handlers; falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down gracefully");
        }

        shutdown.cancel();
    });
}
