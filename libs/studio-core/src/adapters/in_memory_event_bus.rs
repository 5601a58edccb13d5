use crate::{CoreError, EventPublisher};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::trace;

#[derive(Clone, Debug)]
pub struct InMemoryMessage {
    pub topic: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

/// Topic-keyed tokio broadcast channels. Messages published while nobody
/// listens are dropped, like Redis pub/sub.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    channels: Arc<DashMap<String, Sender<InMemoryMessage>>>,
    channel_capacity: usize,
}

impl InMemoryEventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            channel_capacity,
        }
    }

    fn sender(&self, topic: &str) -> Sender<InMemoryMessage> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .value()
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> Receiver<InMemoryMessage> {
        self.sender(topic).subscribe()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        event_type: &str,
        event_payload: &[u8],
    ) -> Result<(), CoreError> {
        let message = InMemoryMessage {
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload: event_payload.to_vec(),
        };
        // Err only means there is no live subscriber.
        if self.sender(topic).send(message).is_err() {
            trace!(topic = %topic, "No subscriber for topic");
        }
        Ok(())
    }
}
