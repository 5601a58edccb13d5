use std::net::SocketAddr;

use studio_core::CoreError;
use studio_core::config::{optional_var, parse_var};
use studio_core::domain::request::DEFAULT_AUTO_REJECT_DAYS;

/// Runtime settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Absent means every tenant lives in process memory.
    pub database_url: Option<String>,
    pub database_prefix: String,
    pub database_max_connections: u32,
    /// Absent means the moka cache and the in-process event bus.
    pub redis_url: Option<String>,
    pub auto_reject_days: i64,
    pub receipt_prefix: String,
    pub session_ttl_seconds: u64,
    /// Interval of the in-process expiry sweep. Only used with the in-memory
    /// store; with Postgres the expiry worker owns the sweep.
    pub sweep_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: None,
            database_prefix: "studio".to_string(),
            database_max_connections: 5,
            redis_url: None,
            auto_reject_days: DEFAULT_AUTO_REJECT_DAYS,
            receipt_prefix: "RCPT".to_string(),
            session_ttl_seconds: 60 * 60 * 24,
            sweep_interval_seconds: 300,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: parse_var("BIND_ADDR", defaults.bind_addr)?,
            database_url: optional_var("DATABASE_URL"),
            database_prefix: optional_var("DATABASE_PREFIX").unwrap_or(defaults.database_prefix),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            redis_url: optional_var("REDIS_URL"),
            auto_reject_days: parse_var("AUTO_REJECT_DAYS", defaults.auto_reject_days)?,
            receipt_prefix: optional_var("RECEIPT_PREFIX").unwrap_or(defaults.receipt_prefix),
            session_ttl_seconds: parse_var("SESSION_TTL_SECONDS", defaults.session_ttl_seconds)?,
            sweep_interval_seconds: parse_var(
                "SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval_seconds,
            )?,
        };
        if config.auto_reject_days <= 0 {
            return Err(CoreError::Configuration(
                "AUTO_REJECT_DAYS must be positive".into(),
            ));
        }
        if config.sweep_interval_seconds == 0 {
            return Err(CoreError::Configuration(
                "SWEEP_INTERVAL_SECONDS must be positive".into(),
            ));
        }
        Ok(config)
    }

    pub fn auto_reject_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.auto_reject_days)
    }
}
