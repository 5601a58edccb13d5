//! Periodically rejects enrollment requests whose auto-reject date has
//! passed, in every tenant database.

use chrono::Utc;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use studio_core::{
    CoreError, EventPublisher,
    adapters::{InMemoryEventBus, PostgresConnector, RedisEventBus},
    config::{optional_var, parse_var},
    domain::{notification::Notifier, request::sweep_tenants},
    tenancy::ConnectionRegistry,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const EVENT_CHANNEL_PREFIX: &str = "studio:";

// Deadlines are stamped on each request when it is created, so the sweep
// needs no auto-reject window of its own.
struct WorkerConfig {
    database_url: String,
    database_prefix: String,
    redis_url: Option<String>,
    sweep_interval_seconds: u64,
}

impl WorkerConfig {
    fn from_env() -> Result<Self, CoreError> {
        let database_url = optional_var("DATABASE_URL").ok_or_else(|| {
            CoreError::Configuration("DATABASE_URL must be set for the expiry worker".into())
        })?;
        let config = Self {
            database_url,
            database_prefix: optional_var("DATABASE_PREFIX").unwrap_or_else(|| "studio".into()),
            redis_url: optional_var("REDIS_URL"),
            sweep_interval_seconds: parse_var("SWEEP_INTERVAL_SECONDS", 300)?,
        };
        if config.sweep_interval_seconds == 0 {
            return Err(CoreError::Configuration(
                "SWEEP_INTERVAL_SECONDS must be positive".into(),
            ));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting expiry worker v{}...", env!("CARGO_PKG_VERSION"));
    dotenv().ok();

    let config = WorkerConfig::from_env()?;

    let connector = Arc::new(PostgresConnector::new(&config.database_url, 2).await?);
    let registry = ConnectionRegistry::new(&config.database_prefix, connector)?;

    let publisher: Arc<dyn EventPublisher> = match &config.redis_url {
        Some(url) => Arc::new(RedisEventBus::new(url, EVENT_CHANNEL_PREFIX).await?),
        None => {
            warn!("REDIS_URL not set, live notification pushes stay inside this process");
            Arc::new(InMemoryEventBus::default())
        }
    };
    let notifier = Notifier::new(publisher);

    let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_seconds));
    info!(interval_seconds = config.sweep_interval_seconds, "Expiry worker running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_tenants(&registry, &notifier, Utc::now()).await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "Rejected overdue requests"),
                    Err(e) => error!("Sweep failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    registry.close_all().await;
    Ok(())
}
