//! Client envelope routing
//!
//! Text frames carry a JSON envelope naming the operation:
//!
//! ```json
//! {"type": "subscribe", "topic": "prices"}
//! {"type": "publish", "topic": "prices", "message": "100"}
//! {"type": "direct", "target": "conn_abc", "message": "hi"}
//! {"type": "broadcast", "message": "hello everyone"}
//! ```
//!
//! Anything that cannot be routed is answered with an `error` frame to the
//! sender; the connection stays open.

use fanhub_cluster::{Payload, SendOutcome, TopicHub};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Longest accepted topic name in bytes
const MAX_TOPIC_LEN: usize = 256;

/// Envelope sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Broadcast { message: String },
    Direct { target: String, message: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, message: String },
}

/// Frames generated by the server itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { id: String },
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn to_payload(&self) -> Payload {
        // Serializing these variants cannot fail
        Payload::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// Route one text frame from `connection_id`
pub async fn handle_text(hub: &TopicHub, connection_id: &str, text: &str) {
    let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Malformed envelope");
            reply_error(hub, connection_id, format!("invalid envelope: {e}")).await;
            return;
        }
    };

    if let Err(message) = dispatch(hub, connection_id, envelope).await {
        reply_error(hub, connection_id, message).await;
    }
}

pub async fn reply_error(hub: &TopicHub, connection_id: &str, message: String) {
    reply(hub, connection_id, &ServerMessage::Error { message }).await;
}

async fn reply(hub: &TopicHub, connection_id: &str, message: &ServerMessage) {
    hub.direct_send(connection_id, message.to_payload()).await;
}

async fn dispatch(hub: &TopicHub, connection_id: &str, envelope: ClientEnvelope) -> Result<(), String> {
    match envelope {
        ClientEnvelope::Broadcast { message } => {
            let report = hub.broadcast(message.into()).await;
            debug!(
                connection_id = %connection_id,
                delivered = report.delivered,
                dropped = report.dropped,
                "Broadcast from client"
            );
        }
        ClientEnvelope::Direct { target, message } => {
            match hub.direct_send(&target, message.into()).await {
                SendOutcome::Delivered => {}
                SendOutcome::NotFound | SendOutcome::Dropped => {
                    return Err(format!("connection {target} is not available"));
                }
            }
        }
        ClientEnvelope::Subscribe { topic } => {
            validate_topic(&topic)?;
            hub.join_topic(connection_id, &topic).await.map_err(|e| {
                warn!(connection_id = %connection_id, topic = %topic, error = %e, "Subscribe failed");
                format!("subscribe to {topic} failed")
            })?;
            reply(hub, connection_id, &ServerMessage::Subscribed { topic }).await;
        }
        ClientEnvelope::Unsubscribe { topic } => {
            hub.leave_topic(connection_id, &topic);
            reply(hub, connection_id, &ServerMessage::Unsubscribed { topic }).await;
        }
        ClientEnvelope::Publish { topic, message } => {
            validate_topic(&topic)?;
            hub.publish_to_topic(&topic, message.into())
                .await
                .map_err(|_| format!("publish to {topic} failed"))?;
        }
    }
    Ok(())
}

fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("topic exceeds {MAX_TOPIC_LEN} bytes"));
    }
    Ok(())
}
