//! DHT error types.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DhtError {
    /// The network failed to announce or look up.
    #[error("network error: {0}")]
    Network(String),

    /// A lookup did not finish in time.
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    /// A hash string could not be parsed.
    #[error("invalid address hash: {0}")]
    InvalidHash(String),
}

/// A specialized Result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
