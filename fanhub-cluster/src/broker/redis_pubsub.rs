use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerError, Delivery, TopicHandler};
use crate::sync::Payload;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Redis broker settings
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    /// Prefix shared by every key and channel of one deployment
    pub key_prefix: String,
    /// Identifier of this instance, stamped on every published envelope
    pub node_id: String,
    /// Timeout for connecting, publishing and subscribing
    pub timeout: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "fanhub:".to_string(),
            node_id: "node".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Redis Pub/Sub broker
///
/// Topic `t` maps to channel `{key_prefix}topic:t`. Publishing goes through a
/// self-healing `ConnectionManager`. Subscriptions share one Pub/Sub
/// connection; a supervisor task reconnects it with exponential backoff and
/// re-subscribes every registered topic.
///
/// Messages published by this instance come back through its own
/// subscription. That is the only path to local subscribers, so they are not
/// filtered by `node_id`.
pub struct RedisBroker {
    client: RedisClient,
    publisher: ConnectionManager,
    config: RedisBrokerConfig,
    topic_prefix: String,
    handlers: DashMap<String, TopicHandler>,
    /// Subscribe half of the live Pub/Sub connection, `None` while reconnecting
    sink: AsyncMutex<Option<PubSubSink>>,
    /// Whether `sink` currently holds a live connection
    connected: watch::Sender<bool>,
    cancel_token: CancellationToken,
}

impl RedisBroker {
    /// Connect to Redis and start the subscriber supervisor
    pub async fn connect(config: RedisBrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let client = RedisClient::open(config.url.as_str())?;

        let publisher = timeout(config.timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| BrokerError::Timeout("connecting to Redis".to_string()))??;

        let broker = Arc::new(Self {
            client,
            publisher,
            topic_prefix: format!("{}topic:", config.key_prefix),
            config,
            handlers: DashMap::new(),
            sink: AsyncMutex::new(None),
            connected: watch::Sender::new(false),
            cancel_token: CancellationToken::new(),
        });

        tokio::spawn(broker.clone().supervise());

        if !broker.wait_connected().await {
            broker.shutdown();
            return Err(BrokerError::Timeout(
                "establishing Redis Pub/Sub connection".to_string(),
            ));
        }

        info!(
            node_id = %broker.config.node_id,
            prefix = %broker.topic_prefix,
            "Redis broker started"
        );

        Ok(broker)
    }

    /// Stop the subscriber supervisor
    pub fn shutdown(&self) {
        info!("Shutting down Redis broker");
        self.cancel_token.cancel();
    }

    /// Wait up to the configured timeout for a live Pub/Sub connection
    async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.subscribe();
        // Bound to a local so the borrowed `Ref` is dropped before `connected`
        let result = timeout(self.config.timeout, connected.wait_for(|up| *up)).await;
        matches!(result, Ok(Ok(_)))
    }

    fn channel_name(&self, topic: &str) -> String {
        format!("{}{topic}", self.topic_prefix)
    }

    /// Keep a Pub/Sub connection alive until cancelled
    async fn supervise(self: Arc<Self>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            match self.run_subscriber().await {
                SubscriberExit::Cancelled => {
                    info!("Redis subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    // The server was reachable, start the backoff over
                    error!(
                        "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Redis subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Redis subscriber task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let pubsub = match timeout(self.config.timeout, self.client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
            Err(_) => {
                return SubscriberExit::ConnectFailed(BrokerError::Timeout(
                    "getting Redis Pub/Sub connection".to_string(),
                ))
            }
        };
        let (mut sink, mut stream) = pubsub.split();

        {
            // Held while re-subscribing so a concurrent `subscribe` cannot
            // slip between the snapshot and the sink becoming visible
            let mut current = self.sink.lock().await;

            let channels: Vec<String> = self
                .handlers
                .iter()
                .map(|entry| self.channel_name(entry.key()))
                .collect();

            if !channels.is_empty() {
                match timeout(self.config.timeout, sink.subscribe(channels.clone())).await {
                    Ok(Ok(())) => {
                        info!(topics = channels.len(), "Re-subscribed topics after reconnect");
                    }
                    Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
                    Err(_) => {
                        return SubscriberExit::ConnectFailed(BrokerError::Timeout(
                            "re-subscribing topics".to_string(),
                        ))
                    }
                }
            }

            *current = Some(sink);
            self.connected.send_replace(true);
        }

        info!("Redis subscriber connected");

        let exit = loop {
            let msg = tokio::select! {
                () = self.cancel_token.cancelled() => break SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };
            match msg {
                Some(msg) => self.dispatch(&msg),
                None => break SubscriberExit::Disconnected,
            }
        };

        *self.sink.lock().await = None;
        self.connected.send_replace(false);
        exit
    }

    /// Hand one Pub/Sub message to the handler of its topic
    ///
    /// Never waits on a bridge: this loop serves every topic, so a message
    /// for a backed-up bridge is dropped instead.
    fn dispatch(&self, msg: &redis::Msg) {
        let channel = msg.get_channel_name();

        let Some(topic) = channel.strip_prefix(&self.topic_prefix) else {
            warn!(channel = %channel, "Message on unexpected channel");
            return;
        };

        let body: String = match msg.get_payload() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                return;
            }
        };

        let envelope = match serde_json::from_str::<TopicEnvelope>(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Failed to deserialize topic envelope");
                return;
            }
        };

        let Some(handler) = self.handlers.get(topic).map(|h| h.clone()) else {
            debug!(topic = %topic, "No handler for topic, dropping message");
            return;
        };

        match handler.try_deliver(envelope.payload) {
            Delivery::Accepted => debug!(
                topic = %topic,
                from_node = %envelope.node_id,
                "Forwarded Redis message to topic bridge"
            ),
            Delivery::Full => warn!(
                topic = %topic,
                from_node = %envelope.node_id,
                "Topic bridge backed up, dropping message"
            ),
            Delivery::Closed => {
                self.handlers.remove_if(topic, |_, h| h.is_closed());
                debug!(topic = %topic, "Topic bridge closed, handler removed");
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), BrokerError> {
        let channel = self.channel_name(topic);
        let envelope = TopicEnvelope {
            node_id: self.config.node_id.clone(),
            payload,
        };
        let body = serde_json::to_string(&envelope)?;

        let mut conn = self.publisher.clone();
        let receivers: usize = timeout(self.config.timeout, conn.publish(&channel, &body))
            .await
            .map_err(|_| BrokerError::Timeout(format!("publishing to {channel}")))??;

        debug!(topic = %topic, receivers = receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BrokerError> {
        let channel = self.channel_name(topic);

        // Ride out a short reconnect instead of failing the join outright
        self.wait_connected().await;
        let mut current = self.sink.lock().await;

        let Some(sink) = current.as_mut() else {
            return Err(BrokerError::Unavailable(
                "Redis subscriber is reconnecting".to_string(),
            ));
        };

        // Registered first so a message racing the SUBSCRIBE reply finds it
        self.handlers.insert(topic.to_string(), handler);

        let result = match timeout(self.config.timeout, sink.subscribe(channel.as_str())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::from(e)),
            Err(_) => Err(BrokerError::Timeout(format!("subscribing to {channel}"))),
        };

        match &result {
            Ok(()) => info!(topic = %topic, channel = %channel, "Subscribed to Redis channel"),
            Err(e) => {
                self.handlers.remove(topic);
                warn!(topic = %topic, error = %e, "Failed to subscribe to Redis channel");
            }
        }

        result
    }
}

/// How the subscriber loop ended, to pick the backoff
enum SubscriberExit {
    Cancelled,
    /// Messages were flowing when the stream ended
    Disconnected,
    /// Could not connect or re-subscribe
    ConnectFailed(BrokerError),
}

/// Wire format of a message on a topic channel
#[derive(Debug, Serialize, Deserialize)]
struct TopicEnvelope {
    node_id: String,
    payload: Payload,
}
