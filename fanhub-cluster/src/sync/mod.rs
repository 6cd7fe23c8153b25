//! Connection registry and topic fan-out

pub mod connection;
pub mod registry;
pub mod topic_hub;

pub use connection::{Connection, ConnectionError, ConnectionState, Payload};
pub use registry::{
    BroadcastReport, ConnectionId, ConnectionInfo, ConnectionRegistry, Departure, RegistryMetrics,
    SendOutcome, DEFAULT_BROADCAST_CONCURRENCY,
};
pub use topic_hub::{HubMetrics, TopicHub, TopicHubConfig, DEFAULT_BRIDGE_BUFFER, DEFAULT_MAX_TOPICS};
