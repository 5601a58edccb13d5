use crate::{Cache, CoreError};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

/// Redis-backed Cache port. Keys are namespaced so several services can share
/// one Redis instance.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
    namespace: String,
    default_ttl_seconds: u64,
}

impl RedisCache {
    pub async fn new(
        redis_url: &str,
        namespace: &str,
        default_ttl_seconds: u64,
    ) -> Result<Self, CoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| CoreError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(CoreError::infrastructure)?;
        info!(namespace = %namespace, "Redis cache connected");
        Ok(Self {
            connection,
            namespace: namespace.to_string(),
            default_ttl_seconds,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut conn = self.connection.clone();
        conn.get(self.key(key))
            .await
            .map_err(CoreError::infrastructure)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Result<(), CoreError> {
        let mut conn = self.connection.clone();
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        conn.set_ex(self.key(key), value, ttl)
            .await
            .map_err(CoreError::infrastructure)
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.connection.clone();
        conn.del(self.key(key))
            .await
            .map(|_: usize| ())
            .map_err(CoreError::infrastructure)
    }
}
