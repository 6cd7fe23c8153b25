//! Broker capability consumed by the topic hub
//!
//! A broker moves payloads between server instances. The hub needs exactly
//! two operations from it: publish to a topic, and subscribe a handler that
//! receives every message later published to that topic (including the
//! instance's own publishes).

mod memory;
mod redis_pubsub;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sync::Payload;

pub use memory::MemoryBroker;
pub use redis_pubsub::{RedisBroker, RedisBrokerConfig};

/// Broker transport failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Result of a non-blocking hand-off to a topic bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The bridge's channel is at capacity; the message was not queued
    Full,
    /// The hub side is gone
    Closed,
}

/// Delivery sink for one topic
///
/// The broker calls [`deliver`](Self::deliver) once per message, from
/// whatever task it runs on. Messages land on a bounded channel drained by
/// the hub's bridge task for the topic.
#[derive(Debug, Clone)]
pub struct TopicHandler {
    topic: Arc<str>,
    sender: mpsc::Sender<Payload>,
}

impl TopicHandler {
    #[must_use]
    pub fn new(topic: &str, sender: mpsc::Sender<Payload>) -> Self {
        Self {
            topic: Arc::from(topic),
            sender,
        }
    }

    /// Create a handler together with the receiving end of its channel
    #[must_use]
    pub fn channel(topic: &str, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(topic, tx), rx)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Hand a message to the hub. Returns `false` once the hub side is gone.
    pub async fn deliver(&self, payload: Payload) -> bool {
        self.sender.send(payload).await.is_ok()
    }

    /// Hand a message to the hub without waiting for channel capacity
    pub fn try_deliver(&self, payload: Payload) -> Delivery {
        match self.sender.try_send(payload) {
            Ok(()) => Delivery::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Whether the hub side has stopped listening
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Publish/subscribe transport shared by server instances
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BrokerError>;
}
