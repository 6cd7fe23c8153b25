pub mod broker;
pub mod error;
pub mod sync;

pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, RedisBroker, RedisBrokerConfig, TopicHandler};
pub use error::{Error, Result};
pub use sync::{
    BroadcastReport, Connection, ConnectionError, ConnectionRegistry, ConnectionState, HubMetrics,
    Payload, SendOutcome, TopicHub, TopicHubConfig,
};
