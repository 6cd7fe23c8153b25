//! Error types for cluster module

use thiserror::Error;

use crate::broker::BrokerError;

/// Cluster error types
///
/// Dead connections never show up here: the registry absorbs them by
/// removing the connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection already registered: {0}")]
    DuplicateConnection(String),

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Topic limit of {0} reached on this node")]
    TopicLimit(usize),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
