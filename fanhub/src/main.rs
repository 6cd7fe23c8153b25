mod error;
mod routing;
mod server;
mod websocket;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use fanhub_cluster::{
    Broker, ConnectionRegistry, MemoryBroker, RedisBroker, RedisBrokerConfig, TopicHub,
    TopicHubConfig,
};
use fanhub_core::{id::generate_node_id, logging, Config};

use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "fanhub")]
#[command(about = "WebSocket topic fan-out server", long_about = None)]
struct Args {
    /// Configuration file (yaml, toml or json); environment variables
    /// prefixed with FANHUB_ override it
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;

    let node_id = if config.hub.node_id.is_empty() {
        generate_node_id()
    } else {
        config.hub.node_id.clone()
    };
    info!(node_id = %node_id, "fanhub starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Connect the broker
    let redis = if config.redis_url().is_empty() {
        info!("Redis not configured, running in single-node mode");
        None
    } else {
        let broker = RedisBroker::connect(RedisBrokerConfig {
            url: config.redis.url.clone(),
            key_prefix: config.redis.key_prefix.clone(),
            node_id: node_id.clone(),
            timeout: config.redis.connect_timeout(),
        })
        .await
        .context("Failed to connect to Redis")?;
        Some(broker)
    };
    let broker: Arc<dyn Broker> = match &redis {
        Some(redis) => redis.clone(),
        None => Arc::new(MemoryBroker::new()),
    };

    // 5. Registry and topic hub
    let registry = ConnectionRegistry::new(config.hub.broadcast_concurrency);
    let hub = TopicHub::new(
        registry,
        broker,
        TopicHubConfig {
            broadcast_concurrency: config.hub.broadcast_concurrency,
            bridge_buffer: config.hub.bridge_buffer,
            max_topics: config.hub.max_topics,
        },
    );

    // 6. Serve until shutdown
    let state = AppState {
        hub,
        config: Arc::new(config),
        node_id: Arc::from(node_id.as_str()),
    };
    server::run(state).await?;

    if let Some(redis) = redis {
        redis.shutdown();
    }

    info!("fanhub stopped");
    Ok(())
}
