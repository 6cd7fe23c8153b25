use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{Broker, BrokerError, TopicHandler};
use crate::sync::Payload;

/// In-process broker
///
/// Used in single-node mode. Several hubs sharing one `MemoryBroker` behave
/// like several server instances sharing a Redis deployment.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    handlers: Arc<DashMap<String, Vec<TopicHandler>>>,
    subscribe_calls: Arc<DashMap<String, usize>>,
    published: Arc<AtomicU64>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `subscribe` was called for `topic`
    #[must_use]
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.subscribe_calls.get(topic).map_or(0, |count| *count)
    }

    /// Handlers for `topic` whose hub is still listening
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .get(topic)
            .map_or(0, |handlers| handlers.iter().filter(|h| !h.is_closed()).count())
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), BrokerError> {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so no shard lock is held while delivering
        let handlers = self
            .handlers
            .get(topic)
            .map(|handlers| handlers.clone())
            .unwrap_or_default();

        let mut delivered = 0;
        let mut closed = 0;
        for handler in &handlers {
            if handler.deliver(payload.clone()).await {
                delivered += 1;
            } else {
                closed += 1;
            }
        }

        if closed > 0 {
            if let Some(mut handlers) = self.handlers.get_mut(topic) {
                handlers.retain(|h| !h.is_closed());
            }
        }

        debug!(topic = %topic, delivered = delivered, "Published to in-memory broker");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BrokerError> {
        self.handlers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        *self.subscribe_calls.entry(topic.to_string()).or_default() += 1;

        debug!(topic = %topic, "Subscribed to in-memory broker topic");
        Ok(())
    }
}
