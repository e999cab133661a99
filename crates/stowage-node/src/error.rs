//! Node error types.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] stowage_storage::StorageError),

    /// Key material failure.
    #[error(transparent)]
    Identity(#[from] stowage_identity::IdentityError),

    /// Wire protocol failure.
    #[error(transparent)]
    Protocol(#[from] stowage_protocol::ProtocolError),

    /// Discovery failure.
    #[error(transparent)]
    Dht(#[from] stowage_dht::DhtError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer is not a known storage provider.
    #[error("peer {peer} is not a storage provider")]
    Unauthorized {
        /// Short id of the peer.
        peer: String,
    },

    /// The handshake ended without proving the peer's identity.
    #[error("peer {peer} did not complete authentication")]
    NotAuthenticated {
        /// Short id of the peer.
        peer: String,
    },

    /// Connecting to a peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address tried.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An operation did not finish in time.
    #[error("{what} timed out after {after:?}")]
    Timeout {
        /// What timed out.
        what: &'static str,
        /// The limit that was hit.
        after: Duration,
    },

    /// Discovery returned no address for the peer.
    #[error("no address known for peer {peer}")]
    NoAddress {
        /// Short id of the peer.
        peer: String,
    },

    /// A session with the same remote endpoint is already running.
    #[error("connection {key} already active")]
    Busy {
        /// The connection key.
        key: String,
    },
}

impl From<stowage_protocol::AuthError> for NodeError {
    fn from(e: stowage_protocol::AuthError) -> Self {
        Self::Protocol(e.into())
    }
}

impl From<stowage_protocol::SyncError> for NodeError {
    fn from(e: stowage_protocol::SyncError) -> Self {
        Self::Protocol(e.into())
    }
}

/// A specialized Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
