use chrono::Utc;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use studio_api::{AppConfig, AppState, create_app};
use studio_core::{
    Cache, DatabaseConnector, EventPublisher,
    adapters::{
        InMemoryCache, InMemoryConnector, InMemoryEventBus, PostgresConnector, RedisCache,
        RedisEventBus,
    },
    domain::{notification::Notifier, payment::ReceiptIssuer, request::sweep_tenants},
    tenancy::ConnectionRegistry,
};
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const CACHE_NAMESPACE: &str = "studio";
const EVENT_CHANNEL_PREFIX: &str = "studio:";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting studio API v{}...", env!("CARGO_PKG_VERSION"));
    dotenv().ok();

    let config = Arc::new(AppConfig::from_env()?);

    let connector: Arc<dyn DatabaseConnector> = match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL tenant databases");
            Arc::new(PostgresConnector::new(url, config.database_max_connections).await?)
        }
        None => {
            warn!("DATABASE_URL not set, tenant data lives in memory only");
            Arc::new(InMemoryConnector::default())
        }
    };

    let (cache, event_bus): (Arc<dyn Cache>, Arc<dyn EventPublisher>) = match &config.redis_url {
        Some(url) => (
            Arc::new(RedisCache::new(url, CACHE_NAMESPACE, config.session_ttl_seconds).await?),
            Arc::new(RedisEventBus::new(url, EVENT_CHANNEL_PREFIX).await?),
        ),
        None => {
            warn!("REDIS_URL not set, sessions and live notifications are process-local");
            (
                Arc::new(InMemoryCache::new(10_000, config.session_ttl_seconds)),
                Arc::new(InMemoryEventBus::default()),
            )
        }
    };

    let registry = Arc::new(ConnectionRegistry::new(&config.database_prefix, connector)?);
    // Fail fast when the directory database is unreachable.
    registry.main().await?;

    // An external worker cannot see in-memory tenants, so sweep here instead.
    if config.database_url.is_none() {
        tokio::spawn(run_expiry_sweep(
            registry.clone(),
            Notifier::new(event_bus.clone()),
            config.clone(),
        ));
    }

    let app_state = AppState {
        registry: registry.clone(),
        cache,
        event_bus,
        receipts: Arc::new(ReceiptIssuer::new(&config.receipt_prefix)),
        config: config.clone(),
    };
    let app = create_app(app_state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Studio API listening on {}", config.bind_addr);

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    registry.close_all().await;
    info!("Tenant connections closed");
    served?;
    Ok(())
}

async fn run_expiry_sweep(
    registry: Arc<ConnectionRegistry>,
    notifier: Notifier,
    config: Arc<AppConfig>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds));
    loop {
        ticker.tick().await;
        match sweep_tenants(&registry, &notifier, Utc::now()).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "Expiry sweep rejected overdue requests"),
            Err(e) => error!("Expiry sweep failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
