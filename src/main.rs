use std::{process, sync::Arc};

use thiserror::Error;
use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use velo::{
    cache::{
        CacheConfig, InvalidatingQueryCache, KeyValueStore, NoopQueryCache, QueryCache,
        RedisStore, StoreError,
    },
    client::{ClientError, HttpTransport, ItemClient, TransportError, proxy_router},
    config,
    infra::{error::InfraError, telemetry},
    ingest::{IngestError, ObserverRegistry, WebhookServer},
};

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to connect to the cache store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let observers = Arc::new(ObserverRegistry::new());

    let cache: Arc<dyn QueryCache> = if cache_config.enabled {
        let redis_url = settings
            .cache
            .redis_url
            .as_ref()
            .ok_or_else(|| InfraError::configuration("cache.redis_url is not configured"))?;
        let store: Arc<dyn KeyValueStore> =
            Arc::new(RedisStore::connect(redis_url, &cache_config).await?);
        info!(keyspace = %cache_config.keyspace, "query cache enabled");
        Arc::new(InvalidatingQueryCache::new(store, observers.clone()))
    } else {
        info!("query cache disabled; all requests pass through");
        Arc::new(NoopQueryCache)
    };

    let webhook = WebhookServer::bind(
        settings.server.webhook_addr,
        &settings.server.webhook_path,
        observers,
        cache_config.event_buffer_non_zero(),
        cache_config.debounce_interval(),
    )
    .await?;

    let transport = Arc::new(HttpTransport::new(
        settings.origin.base_url.clone(),
        settings.origin.timeout,
    )?);
    let client = ItemClient::new(transport, cache, settings.origin.token.clone())?;
    let app = proxy_router(client, settings.origin.strip_segments);

    let listener = tokio::net::TcpListener::bind(settings.server.proxy_addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        proxy = %settings.server.proxy_addr,
        webhook = %webhook.local_addr(),
        origin = %settings.origin.base_url,
        "velo started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::from)?;

    // Flush the pending invalidation window before exiting.
    webhook.shutdown().await;
    info!("velo stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
