use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Trust the first hop of `X-Forwarded-For` as the connection origin
    pub trust_forwarded_for: bool,
    /// Maximum accepted WebSocket frame size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            trust_forwarded_for: false,
            max_message_size: 64 * 1024,
        }
    }
}

/// Redis broker settings. An empty `url` selects single-node mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
            key_prefix: "fanhub:".to_string(),
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Connection registry and topic engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Node identifier; generated at startup when empty
    pub node_id: String,
    /// Size of the admission gate used by broadcast and topic fan-out
    pub broadcast_concurrency: usize,
    /// Admission threshold enforced by the accept layer
    pub max_connections_per_origin: usize,
    /// Capacity of each topic bridge's inbound channel
    pub bridge_buffer: usize,
    /// Capacity of each connection's outbound queue
    pub connection_buffer: usize,
    /// Topics this node will bridge to the broker; bridges are never closed
    pub max_topics: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            broadcast_concurrency: 100,
            max_connections_per_origin: 5,
            bridge_buffer: 1024,
            connection_buffer: 256,
            max_topics: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then environment overrides
    /// (`FANHUB_SERVER__HTTP_PORT`, `FANHUB_REDIS__URL`, ...)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FANHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check settings that would otherwise fail at runtime.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.hub.broadcast_concurrency == 0 {
            errors.push("hub.broadcast_concurrency must be at least 1".to_string());
        }
        if self.hub.max_connections_per_origin == 0 {
            errors.push("hub.max_connections_per_origin must be at least 1".to_string());
        }
        if self.hub.bridge_buffer == 0 || self.hub.connection_buffer == 0 {
            errors.push("hub buffers must be at least 1".to_string());
        }
        if self.hub.max_topics == 0 {
            errors.push("hub.max_topics must be at least 1".to_string());
        }
        if !self.redis.url.is_empty()
            && !(self.redis.url.starts_with("redis://") || self.redis.url.starts_with("rediss://"))
        {
            errors.push(format!("redis.url has an unsupported scheme: {}", self.redis.url));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Redis URL, empty in single-node mode
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
