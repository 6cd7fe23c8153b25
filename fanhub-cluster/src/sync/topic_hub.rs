use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Payload;
use super::registry::{
    BroadcastReport, ConnectionId, ConnectionRegistry, RegistryMetrics, SendOutcome,
    DEFAULT_BROADCAST_CONCURRENCY,
};
use crate::broker::{Broker, TopicHandler};
use crate::error::{Error, Result};

/// Default capacity of a topic bridge's inbound channel
pub const DEFAULT_BRIDGE_BUFFER: usize = 1024;

/// Default cap on topics bridged by one node
pub const DEFAULT_MAX_TOPICS: usize = 10_000;

/// Topic hub configuration
#[derive(Debug, Clone)]
pub struct TopicHubConfig {
    /// Admission gate size for broadcast and topic fan-out
    pub broadcast_concurrency: usize,
    /// Messages buffered between the broker and a topic's bridge task
    pub bridge_buffer: usize,
    /// Bridges are never torn down, so this bounds broker subscriptions and
    /// bridge tasks for the life of the process
    pub max_topics: usize,
}

impl Default for TopicHubConfig {
    fn default() -> Self {
        Self {
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
            bridge_buffer: DEFAULT_BRIDGE_BUFFER,
            max_topics: DEFAULT_MAX_TOPICS,
        }
    }
}

/// Hub metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct HubMetrics {
    #[serde(flatten)]
    pub registry: RegistryMetrics,
    pub bridged_topics: usize,
    pub subscribed_connections: usize,
    pub bridged_messages: u64,
}

/// Topics joined by one registration of a connection id
#[derive(Debug)]
struct Subscription {
    generation: u64,
    topics: HashSet<String>,
}

/// Topic fan-out engine
///
/// Tracks which topics each local connection joined and holds exactly one
/// broker subscription (a bridge) per topic. Every message the broker
/// delivers on a bridge is re-sent to the local subscribers of that topic.
/// Publishing always goes through the broker, so a message published here
/// reaches local subscribers the same way a peer's message does.
///
/// Bridges are never torn down: once a topic is bridged it stays bridged for
/// the life of the process.
#[derive(Clone)]
pub struct TopicHub {
    registry: ConnectionRegistry,
    broker: Arc<dyn Broker>,
    /// connection id -> joined topics
    subscriptions: Arc<DashMap<ConnectionId, Subscription>>,
    /// Topics with an open broker subscription
    bridged: Arc<DashMap<String, ()>>,
    /// Serializes bridge opening per topic
    bridge_locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
    config: TopicHubConfig,
    bridged_messages: Arc<AtomicU64>,
    cancel_token: CancellationToken,
}

impl TopicHub {
    /// Create a hub over `registry` and `broker`
    ///
    /// Spawns a task that drops the subscriptions of connections leaving the
    /// registry, so this must run inside a Tokio runtime.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, broker: Arc<dyn Broker>, config: TopicHubConfig) -> Self {
        let hub = Self {
            registry,
            broker,
            subscriptions: Arc::new(DashMap::new()),
            bridged: Arc::new(DashMap::new()),
            bridge_locks: Arc::new(DashMap::new()),
            config,
            bridged_messages: Arc::new(AtomicU64::new(0)),
            cancel_token: CancellationToken::new(),
        };
        hub.spawn_departure_pruner();
        hub
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Add `topic` to a connection's subscriptions, bridging the topic to the
    /// broker if this is its first subscriber on this node
    ///
    /// On a broker failure the join has no effect and a later join retries
    /// the bridge.
    pub async fn join_topic(&self, connection_id: &str, topic: &str) -> Result<()> {
        let Some(generation) = self.registry.generation_of(connection_id) else {
            return Err(Error::NotFound(connection_id.to_string()));
        };

        self.ensure_bridge(topic).await?;

        let newly_joined = {
            let mut subscription = self
                .subscriptions
                .entry(connection_id.to_string())
                .or_insert_with(|| Subscription {
                    generation,
                    topics: HashSet::new(),
                });
            if subscription.generation > generation {
                // Replaced by a newer registration while the bridge was opening
                return Err(Error::NotFound(connection_id.to_string()));
            }
            if subscription.generation < generation {
                // Left over from an earlier registration under the same id
                subscription.generation = generation;
                subscription.topics.clear();
            }
            subscription.topics.insert(topic.to_string())
        };

        // The connection may have left while the bridge was opening
        if self.registry.generation_of(connection_id) != Some(generation) {
            self.forget(connection_id, generation);
            return Err(Error::NotFound(connection_id.to_string()));
        }

        if newly_joined {
            debug!(connection_id = %connection_id, topic = %topic, "Connection joined topic");
        }

        Ok(())
    }

    /// Drop one topic from a connection's subscriptions. The bridge stays open.
    pub fn leave_topic(&self, connection_id: &str, topic: &str) -> bool {
        let left = self
            .subscriptions
            .get_mut(connection_id)
            .is_some_and(|mut subscription| subscription.topics.remove(topic));

        self.subscriptions
            .remove_if(connection_id, |_, subscription| subscription.topics.is_empty());

        if left {
            debug!(connection_id = %connection_id, topic = %topic, "Connection left topic");
        }
        left
    }

    /// Forward a payload to the broker. Local subscribers receive it when the
    /// broker delivers it back on the topic's bridge.
    pub async fn publish_to_topic(&self, topic: &str, payload: Payload) -> Result<()> {
        let size = payload.len();

        self.broker.publish(topic, payload).await.map_err(|e| {
            warn!(topic = %topic, error = %e, "Failed to publish to broker");
            Error::from(e)
        })?;

        debug!(topic = %topic, bytes = size, "Published to topic");
        Ok(())
    }

    /// Send to one local connection, bypassing the broker
    pub async fn direct_send(&self, connection_id: &str, payload: Payload) -> SendOutcome {
        self.registry.send(connection_id, payload).await
    }

    /// Send to every local connection, bypassing the broker
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        self.registry
            .broadcast_with(payload, self.config.broadcast_concurrency)
            .await
    }

    /// Unregister a connection and discard its subscriptions
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        let Some(generation) = self.registry.take(connection_id).await else {
            return false;
        };
        self.forget(connection_id, generation);
        true
    }

    /// Drop the subscriptions of one registration, leaving any newer
    /// registration under the same id alone
    fn forget(&self, connection_id: &str, generation: u64) {
        self.subscriptions
            .remove_if(connection_id, |_, subscription| subscription.generation == generation);
    }

    /// Topics a connection has joined, sorted
    #[must_use]
    pub fn topics_of(&self, connection_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .get(connection_id)
            .map(|subscription| subscription.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Snapshot of the local connections subscribed to `topic`
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<ConnectionId> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().topics.contains(topic))
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn is_bridged(&self, topic: &str) -> bool {
        self.bridged.contains_key(topic)
    }

    #[must_use]
    pub fn bridged_topics(&self) -> Vec<String> {
        self.bridged.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn metrics(&self) -> HubMetrics {
        HubMetrics {
            registry: self.registry.metrics(),
            bridged_topics: self.bridged.len(),
            subscribed_connections: self.subscriptions.len(),
            bridged_messages: self.bridged_messages.load(Ordering::Relaxed),
        }
    }

    /// Stop bridge tasks and the departure pruner
    pub fn shutdown(&self) {
        info!(bridged_topics = self.bridged.len(), "Shutting down topic hub");
        self.cancel_token.cancel();
    }

    /// Open the topic's bridge unless it is already open
    async fn ensure_bridge(&self, topic: &str) -> Result<()> {
        if self.bridged.contains_key(topic) {
            return Ok(());
        }

        let lock = self
            .bridge_locks
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.bridged.contains_key(topic) {
            return Ok(());
        }

        if self.bridged.len() >= self.config.max_topics {
            warn!(topic = %topic, limit = self.config.max_topics, "Topic limit reached, refusing to bridge");
            self.release_bridge_lock(topic, &lock);
            return Err(Error::TopicLimit(self.config.max_topics));
        }

        // Marked bridged only after the broker accepted the subscription, so
        // a failed or abandoned attempt leaves the topic unbridged
        let (handler, rx) = TopicHandler::channel(topic, self.config.bridge_buffer);
        if let Err(e) = self.broker.subscribe(topic, handler).await {
            warn!(topic = %topic, error = %e, "Failed to bridge topic to broker");
            self.release_bridge_lock(topic, &lock);
            return Err(e.into());
        }

        self.bridged.insert(topic.to_string(), ());
        // Safe to forget once bridged: anyone still holding the lock will see
        // the mark before opening another bridge
        self.bridge_locks.remove(topic);

        tokio::spawn(self.clone().run_bridge(topic.to_string(), rx));

        info!(topic = %topic, "Topic bridged to broker");
        Ok(())
    }

    /// Forget an unbridged topic's lock unless another joiner is queued on it
    fn release_bridge_lock(&self, topic: &str, lock: &Arc<AsyncMutex<()>>) {
        // One reference held by the map and one by the caller
        self.bridge_locks.remove_if(topic, |_, held| {
            Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2
        });
    }

    /// Re-deliver every broker message on `topic` to its local subscribers
    async fn run_bridge(self, topic: String, mut rx: mpsc::Receiver<Payload>) {
        loop {
            let payload = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                payload = rx.recv() => payload,
            };

            let Some(payload) = payload else {
                // The broker let go of the handler; allow a later join to re-bridge
                self.bridged.remove(&topic);
                warn!(topic = %topic, "Broker closed topic bridge");
                return;
            };

            self.bridged_messages.fetch_add(1, Ordering::Relaxed);
            self.deliver_local(&topic, &payload).await;
        }
    }

    async fn deliver_local(&self, topic: &str, payload: &Payload) {
        let subscribers = self.subscribers_of(topic);
        if subscribers.is_empty() {
            debug!(topic = %topic, "No local subscribers for topic message");
            return;
        }

        let report = self
            .registry
            .send_many(&subscribers, payload, self.config.broadcast_concurrency)
            .await;

        debug!(
            topic = %topic,
            subscribers = subscribers.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Forwarded topic message to local subscribers"
        );
    }

    /// Forget the subscriptions of connections leaving the registry
    fn spawn_departure_pruner(&self) {
        let mut departures = self.registry.subscribe_departures();
        let hub = self.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = hub.cancel_token.cancelled() => return,
                    next = departures.recv() => next,
                };

                match next {
                    Ok(departure) => {
                        hub.forget(&departure.connection_id, departure.generation);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Departure notices lagged, sweeping subscriptions");
                        hub.subscriptions.retain(|id, subscription| {
                            hub.registry.generation_of(id) == Some(subscription.generation)
                        });
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryBroker};
    use crate::sync::connection::testing::MockConnection;
    use crate::sync::registry::DEPARTURE_CHANNEL_CAPACITY;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Memory broker with injectable faults
    #[derive(Default)]
    struct ScriptedBroker {
        inner: MemoryBroker,
        failing_subscribes: AtomicUsize,
        fail_publish: AtomicBool,
        /// Accept publishes without delivering them anywhere
        swallow_publish: AtomicBool,
        subscribe_delay: Duration,
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn publish(&self, topic: &str, payload: Payload) -> std::result::Result<(), BrokerError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(BrokerError::Unavailable("publish refused".to_string()));
            }
            if self.swallow_publish.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str, handler: TopicHandler) -> std::result::Result<(), BrokerError> {
            tokio::time::sleep(self.subscribe_delay).await;
            let should_fail = self
                .failing_subscribes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(BrokerError::Unavailable("subscribe refused".to_string()));
            }
            self.inner.subscribe(topic, handler).await
        }
    }

    fn hub_with(broker: Arc<dyn Broker>) -> TopicHub {
        TopicHub::new(ConnectionRegistry::default(), broker, TopicHubConfig::default())
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_prices_scenario() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));
        let c1 = MockConnection::open();
        let c2 = MockConnection::open();
        let c3 = MockConnection::open();
        hub.registry().add("c1", c1.clone(), "ip1").unwrap();
        hub.registry().add("c2", c2.clone(), "ip2").unwrap();
        hub.registry().add("c3", c3.clone(), "ip3").unwrap();

        hub.join_topic("c1", "prices").await.unwrap();
        hub.join_topic("c2", "prices").await.unwrap();
        hub.publish_to_topic("prices", "100".into()).await.unwrap();

        wait_until(|| c1.received_text().len() == 1 && c2.received_text().len() == 1).await;

        assert_eq!(c1.received_text(), vec!["100"]);
        assert_eq!(c2.received_text(), vec!["100"]);
        assert!(c3.received_text().is_empty());
        assert_eq!(broker.subscribe_count("prices"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_joiners_open_one_bridge() {
        let broker = Arc::new(ScriptedBroker {
            subscribe_delay: Duration::from_millis(20),
            ..Default::default()
        });
        let hub = hub_with(broker.clone());

        for i in 0..16 {
            hub.registry().add(format!("c{i}"), MockConnection::open(), "ip").unwrap();
        }

        let joins: Vec<_> = (0..16)
            .map(|i| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.join_topic(&format!("c{i}"), "prices").await })
            })
            .collect();
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert_eq!(broker.inner.subscribe_count("prices"), 1);
        assert_eq!(hub.subscribers_of("prices").len(), 16);
        assert_eq!(hub.bridged_topics(), vec!["prices".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_bridge_rolls_back_and_retries() {
        let broker = Arc::new(ScriptedBroker {
            failing_subscribes: AtomicUsize::new(1),
            ..Default::default()
        });
        let hub = hub_with(broker.clone());
        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();

        let result = hub.join_topic("c1", "prices").await;
        assert!(matches!(result, Err(Error::Broker(_))));
        assert!(!hub.is_bridged("prices"));
        assert!(hub.topics_of("c1").is_empty());
        assert!(hub.bridge_locks.is_empty());

        hub.join_topic("c1", "prices").await.unwrap();
        assert!(hub.is_bridged("prices"));
        assert_eq!(hub.topics_of("c1"), vec!["prices".to_string()]);
        assert_eq!(broker.inner.subscribe_count("prices"), 1);
    }

    #[tokio::test]
    async fn test_join_requires_registered_connection() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));

        let result = hub.join_topic("ghost", "prices").await;
        assert!(matches!(result, Err(Error::NotFound(id)) if id == "ghost"));
        assert_eq!(broker.subscribe_count("prices"), 0);
    }

    #[tokio::test]
    async fn test_publish_only_reaches_subscribers_through_the_broker() {
        let broker = Arc::new(ScriptedBroker::default());
        broker.swallow_publish.store(true, Ordering::SeqCst);
        let hub = hub_with(broker.clone());
        let c1 = MockConnection::open();
        hub.registry().add("c1", c1.clone(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();

        hub.publish_to_topic("prices", "100".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The broker never delivered, so neither did the hub
        assert!(c1.received_text().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let broker = Arc::new(ScriptedBroker::default());
        broker.fail_publish.store(true, Ordering::SeqCst);
        let hub = hub_with(broker);

        let result = hub.publish_to_topic("prices", "100".into()).await;
        assert!(matches!(result, Err(Error::Broker(BrokerError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_direct_and_broadcast_bypass_broker() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));
        let c1 = MockConnection::open();
        let c2 = MockConnection::open();
        hub.registry().add("c1", c1.clone(), "ip1").unwrap();
        hub.registry().add("c2", c2.clone(), "ip1").unwrap();

        assert_eq!(hub.direct_send("c1", "only you".into()).await, SendOutcome::Delivered);
        let report = hub.broadcast("everyone".into()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(c1.received_text(), vec!["only you", "everyone"]);
        assert_eq!(c2.received_text(), vec!["everyone"]);
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_hubs_sharing_a_broker_see_each_others_publishes() {
        let broker = MemoryBroker::new();
        let node_a = hub_with(Arc::new(broker.clone()));
        let node_b = hub_with(Arc::new(broker.clone()));
        let on_a = MockConnection::open();
        let on_b = MockConnection::open();
        node_a.registry().add("a1", on_a.clone(), "ip1").unwrap();
        node_b.registry().add("b1", on_b.clone(), "ip2").unwrap();

        node_a.join_topic("a1", "news").await.unwrap();
        node_b.join_topic("b1", "news").await.unwrap();
        node_a.publish_to_topic("news", "hello".into()).await.unwrap();

        wait_until(|| on_a.received_text().len() == 1 && on_b.received_text().len() == 1).await;
        // One bridge per instance
        assert_eq!(broker.subscribe_count("news"), 2);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_removed_and_pruned() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));
        let healthy = MockConnection::open();
        hub.registry().add("dead", MockConnection::failing(), "ip1").unwrap();
        hub.registry().add("alive", healthy.clone(), "ip1").unwrap();
        hub.join_topic("dead", "prices").await.unwrap();
        hub.join_topic("alive", "prices").await.unwrap();

        hub.publish_to_topic("prices", "100".into()).await.unwrap();

        wait_until(|| healthy.received_text().len() == 1).await;
        wait_until(|| hub.topics_of("dead").is_empty()).await;
        assert!(!hub.registry().contains("dead"));
        assert_eq!(hub.subscribers_of("prices"), vec!["alive".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_connection_discards_subscriptions() {
        let hub = hub_with(Arc::new(MemoryBroker::new()));
        let conn = MockConnection::open();
        hub.registry().add("c1", conn.clone(), "ip1").unwrap();
        hub.join_topic("c1", "a").await.unwrap();
        hub.join_topic("c1", "b").await.unwrap();
        assert_eq!(hub.topics_of("c1"), vec!["a".to_string(), "b".to_string()]);

        assert!(hub.remove_connection("c1").await);
        assert!(!hub.remove_connection("c1").await);

        assert!(hub.topics_of("c1").is_empty());
        assert_eq!(conn.closes(), 1);
    }

    #[tokio::test]
    async fn test_bridge_outlives_its_last_subscriber() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));
        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();

        hub.join_topic("c1", "prices").await.unwrap();
        assert!(hub.leave_topic("c1", "prices"));
        assert!(!hub.leave_topic("c1", "prices"));
        assert!(hub.subscribers_of("prices").is_empty());
        assert!(hub.is_bridged("prices"));

        hub.join_topic("c1", "prices").await.unwrap();
        assert_eq!(broker.subscribe_count("prices"), 1);
    }

    #[tokio::test]
    async fn test_dropped_join_leaves_topic_unbridged() {
        let broker = Arc::new(ScriptedBroker {
            subscribe_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let hub = hub_with(broker.clone());
        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), hub.join_topic("c1", "prices")).await;
        assert!(abandoned.is_err());
        assert!(!hub.is_bridged("prices"));
        assert!(hub.topics_of("c1").is_empty());

        hub.join_topic("c1", "prices").await.unwrap();
        assert!(hub.is_bridged("prices"));
        assert_eq!(broker.inner.subscribe_count("prices"), 1);
    }

    #[tokio::test]
    async fn test_reused_identity_keeps_subscription() {
        let broker = MemoryBroker::new();
        let hub = hub_with(Arc::new(broker.clone()));

        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();
        hub.join_topic("c1", "news").await.unwrap();

        // Leaves through the registry, so only the departure notice cleans up
        hub.registry().remove("c1").await;

        let second = MockConnection::open();
        hub.registry().add("c1", second.clone(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();

        // Let the pruner handle the earlier registration's notice
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.topics_of("c1"), vec!["prices".to_string()]);

        hub.publish_to_topic("prices", "100".into()).await.unwrap();
        wait_until(|| second.received_text().len() == 1).await;
        assert_eq!(second.received_text(), vec!["100"]);
    }

    #[tokio::test]
    async fn test_remove_then_rejoin_under_same_identity() {
        let hub = hub_with(Arc::new(MemoryBroker::new()));

        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();
        assert!(hub.remove_connection("c1").await);

        let second = MockConnection::open();
        hub.registry().add("c1", second.clone(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.publish_to_topic("prices", "100".into()).await.unwrap();
        wait_until(|| second.received_text().len() == 1).await;
        assert_eq!(hub.subscribers_of("prices"), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_lagged_departures_trigger_sweep() {
        let hub = hub_with(Arc::new(MemoryBroker::new()));
        hub.registry().add("keep", MockConnection::open(), "ip1").unwrap();
        hub.registry().add("gone", MockConnection::open(), "ip1").unwrap();
        hub.join_topic("keep", "prices").await.unwrap();
        hub.join_topic("gone", "prices").await.unwrap();

        // Overflow the notice channel before the pruner runs so the notice
        // for "gone" is lost
        hub.registry().remove("gone").await;
        for i in 0..DEPARTURE_CHANNEL_CAPACITY + 8 {
            let id = format!("filler{i}");
            hub.registry().add(id.clone(), MockConnection::open(), "ip2").unwrap();
            hub.registry().remove(&id).await;
        }

        wait_until(|| hub.topics_of("gone").is_empty()).await;
        assert_eq!(hub.subscribers_of("prices"), vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn test_topic_limit() {
        let broker = MemoryBroker::new();
        let hub = TopicHub::new(
            ConnectionRegistry::default(),
            Arc::new(broker.clone()),
            TopicHubConfig {
                max_topics: 2,
                ..Default::default()
            },
        );
        hub.registry().add("c1", MockConnection::open(), "ip1").unwrap();

        hub.join_topic("c1", "a").await.unwrap();
        hub.join_topic("c1", "b").await.unwrap();
        let refused = hub.join_topic("c1", "c").await;

        assert!(matches!(refused, Err(Error::TopicLimit(2))));
        assert!(!hub.is_bridged("c"));
        assert_eq!(broker.subscribe_count("c"), 0);
        assert!(hub.bridge_locks.is_empty());
        assert_eq!(hub.topics_of("c1"), vec!["a".to_string(), "b".to_string()]);

        // Already bridged topics stay joinable
        hub.registry().add("c2", MockConnection::open(), "ip1").unwrap();
        hub.join_topic("c2", "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics() {
        let hub = hub_with(Arc::new(MemoryBroker::new()));
        let conn = MockConnection::open();
        hub.registry().add("c1", conn.clone(), "ip1").unwrap();
        hub.join_topic("c1", "prices").await.unwrap();
        hub.publish_to_topic("prices", "1".into()).await.unwrap();
        wait_until(|| conn.received_text().len() == 1).await;

        let metrics = hub.metrics();
        assert_eq!(metrics.registry.active_connections, 1);
        assert_eq!(metrics.bridged_topics, 1);
        assert_eq!(metrics.subscribed_connections, 1);
        assert_eq!(metrics.bridged_messages, 1);

        hub.shutdown();
    }
}
