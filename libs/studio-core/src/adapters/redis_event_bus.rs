use crate::{CoreError, EventPublisher};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection, aio::PubSub};
use tracing::info;

/// Redis pub/sub EventPublisher. Each topic maps to the channel
/// `<prefix><topic>`; the payload is published as-is.
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    publish_connection: MultiplexedConnection,
    channel_prefix: String,
}

impl RedisEventBus {
    pub async fn new(redis_url: &str, channel_prefix: &str) -> Result<Self, CoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| CoreError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        let publish_connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(CoreError::infrastructure)?;
        info!(prefix = %channel_prefix, "Redis event bus connected");
        Ok(Self {
            client,
            publish_connection,
            channel_prefix: channel_prefix.to_string(),
        })
    }

    pub fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.channel_prefix, topic)
    }

    /// Opens a dedicated pub/sub connection already subscribed to `topic`.
    pub async fn subscribe(&self, topic: &str) -> Result<PubSub, CoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(CoreError::infrastructure)?;
        pubsub
            .subscribe(self.channel(topic))
            .await
            .map_err(CoreError::infrastructure)?;
        Ok(pubsub)
    }
}

#[async_trait]
impl EventPublisher for RedisEventBus {
    async fn publish(
        &self,
        topic: &str,
        _event_type: &str,
        event_payload: &[u8],
    ) -> Result<(), CoreError> {
        let mut conn = self.publish_connection.clone();
        let _: usize = conn
            .publish(self.channel(topic), event_payload)
            .await
            .map_err(CoreError::infrastructure)?;
        Ok(())
    }
}
