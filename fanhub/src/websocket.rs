//! WebSocket accept layer
//!
//! Each upgraded socket is split: a writer task drains a bounded queue into
//! the sink, and the handler loop reads frames and routes them through the
//! hub. The registry only ever sees the queue side, wrapped in
//! [`WsConnection`].

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use fanhub_cluster::{Connection, ConnectionError, ConnectionRegistry, ConnectionState, Payload};
use fanhub_core::id::generate_connection_id;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::routing::{self, ServerMessage};
use crate::server::AppState;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Registry-facing handle of one WebSocket
///
/// Sends never block: a client that lets its queue fill up is reported as
/// failed and gets removed by the registry.
pub struct WsConnection {
    sender: mpsc::Sender<Message>,
    state: AtomicU8,
}

impl WsConnection {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            state: AtomicU8::new(STATE_OPEN),
        }
    }

    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn state(&self) -> ConnectionState {
        if self.sender.is_closed() {
            return ConnectionState::Closed;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    async fn send(&self, payload: Payload) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Open {
            return Err(ConnectionError::Closed);
        }

        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes),
        };

        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ConnectionError::Transport("outbound queue full, client too slow".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                self.mark_closed();
                ConnectionError::Closed
            }
        })
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // The writer task stops after forwarding the close frame
        let result = self
            .sender
            .try_send(Message::Close(None))
            .map_err(|e| ConnectionError::Transport(e.to_string()));
        self.mark_closed();
        result
    }
}

/// Origin of a request: the first `X-Forwarded-For` hop when trusted,
/// otherwise the peer address
#[must_use]
pub fn client_origin(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }
    peer.ip().to_string()
}

/// Reject the upgrade when `origin` already holds `max_per_origin` connections
pub fn check_admission(
    registry: &ConnectionRegistry,
    origin: &str,
    max_per_origin: usize,
) -> Result<(), AppError> {
    let current = registry.connections_by_origin(origin).len();
    if current >= max_per_origin {
        warn!(origin = %origin, current = current, "Connection limit reached for origin");
        return Err(AppError::too_many_requests(format!(
            "Too many connections from {origin}"
        )));
    }
    Ok(())
}

/// `GET /ws`
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let origin = client_origin(&headers, peer, state.config.server.trust_forwarded_for);
    check_admission(
        state.hub.registry(),
        &origin,
        state.config.hub.max_connections_per_origin,
    )?;

    Ok(ws
        .max_message_size(state.config.server.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, origin)))
}

async fn handle_socket(socket: WebSocket, state: AppState, origin: String) {
    let connection_id = generate_connection_id();
    let (sink, mut stream) = socket.split();

    let (tx, rx) = mpsc::channel(state.config.hub.connection_buffer.max(1));
    let connection = Arc::new(WsConnection::new(tx));
    tokio::spawn(write_loop(sink, rx, connection.clone()));

    if let Err(e) = state
        .hub
        .registry()
        .add(connection_id.clone(), connection.clone(), origin.clone())
    {
        error!(connection_id = %connection_id, error = %e, "Failed to register WebSocket");
        return;
    }

    info!(connection_id = %connection_id, origin = %origin, "WebSocket connection established");

    let welcome = ServerMessage::Welcome {
        id: connection_id.clone(),
    };
    state
        .hub
        .direct_send(&connection_id, welcome.to_payload())
        .await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                routing::handle_text(&state.hub, &connection_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                routing::reply_error(
                    &state.hub,
                    &connection_id,
                    "binary frames are not supported".to_string(),
                )
                .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }

        // Removed by the registry after a failed write
        if !state.hub.registry().contains(&connection_id) {
            break;
        }
    }

    state.hub.remove_connection(&connection_id).await;
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    connection: Arc<WsConnection>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
        if closing {
            break;
        }
    }
    connection.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    #[test]
    fn test_origin_from_peer() {
        let headers = HeaderMap::new();
        assert_eq!(client_origin(&headers, peer(), true), "10.0.0.7");
    }

    #[test]
    fn test_origin_from_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));

        assert_eq!(client_origin(&headers, peer(), true), "203.0.113.9");
        // Untrusted header is ignored
        assert_eq!(client_origin(&headers, peer(), false), "10.0.0.7");
    }

    #[tokio::test]
    async fn test_admission_rejects_sixth_connection() {
        let registry = ConnectionRegistry::default();
        let mut receivers = Vec::new();
        for i in 0..5 {
            assert!(check_admission(&registry, "1.2.3.4", 5).is_ok());
            let (tx, rx) = mpsc::channel(4);
            receivers.push(rx);
            registry
                .add(format!("c{i}"), Arc::new(WsConnection::new(tx)), "1.2.3.4")
                .unwrap();
        }

        let rejected = check_admission(&registry, "1.2.3.4", 5).unwrap_err();
        assert_eq!(rejected.status, axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert!(check_admission(&registry, "5.6.7.8", 5).is_ok());

        registry.remove("c0").await;
        assert!(check_admission(&registry, "1.2.3.4", 5).is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_fails_send() {
        let (tx, _rx) = mpsc::channel(1);
        let connection = WsConnection::new(tx);

        connection.send("one".into()).await.unwrap();
        let overflow = connection.send("two".into()).await;
        assert!(matches!(overflow, Err(ConnectionError::Transport(_))));
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_dropped_writer_reports_closed() {
        let (tx, rx) = mpsc::channel(4);
        let connection = WsConnection::new(tx);
        drop(rx);

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(connection.send("x".into()).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let connection = WsConnection::new(tx);

        connection.close().await.unwrap();
        connection.close().await.unwrap();

        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(rx.try_recv().is_err());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
