//! HTTP server lifecycle
//!
//! Serves the WebSocket endpoint and the health probe, and on shutdown closes
//! every registered connection before stopping the hub.

use axum::{extract::State, routing::get, Json, Router};
use fanhub_cluster::{HubMetrics, TopicHub};
use fanhub_core::Config;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::websocket::websocket_handler;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: TopicHub,
    pub config: Arc<Config>,
    pub node_id: Arc<str>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    #[serde(flatten)]
    hub: HubMetrics,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.to_string(),
        hub: state.hub.metrics(),
    })
}

/// Serve until a shutdown signal arrives
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let http_address = state.config.http_address();
    let http_addr: SocketAddr = http_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

    let listener = tokio::net::TcpListener::bind(http_addr).await.map_err(|e| {
        error!("Failed to bind HTTP address {}: {}", http_addr, e);
        e
    })?;
    info!("HTTP server listening on {}", http_addr);

    let hub = state.hub.clone();
    let graceful = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, closing connections...");
        let closed = hub.registry().close_all().await;
        info!(closed = closed, "All connections closed");
    };

    axum::serve(
        listener,
        create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .await?;

    state.hub.shutdown();
    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanhub_cluster::{ConnectionRegistry, MemoryBroker, TopicHubConfig};

    #[tokio::test]
    async fn test_health_reports_node_and_metrics() {
        let hub = TopicHub::new(
            ConnectionRegistry::default(),
            Arc::new(MemoryBroker::new()),
            TopicHubConfig::default(),
        );
        let state = AppState {
            hub,
            config: Arc::new(Config::default()),
            node_id: Arc::from("node-a"),
        };

        let Json(health) = health_check(State(state)).await;
        let json = serde_json::to_value(&health).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["node_id"], "node-a");
        assert_eq!(json["active_connections"], 0);
        assert_eq!(json["bridged_topics"], 0);
    }
}
