//! Protocol error types.

use thiserror::Error;

/// Errors raised by the mutual authentication handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The first byte is not a known handshake message type.
    #[error("unknown authentication message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// A message arrived in a state where it is not allowed.
    #[error("unexpected {message} message in state {state}")]
    UnexpectedMessage {
        /// The message that arrived.
        message: &'static str,
        /// The state the authenticator was in.
        state: &'static str,
    },

    /// The peer could not prove possession of its key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The message could not be parsed.
    #[error("malformed authentication message: {0}")]
    Malformed(String),

    /// The configured challenge size cannot be carried in a message.
    #[error("invalid challenge size: {0} (must be 1..=65535)")]
    InvalidChallengeSize(usize),

    /// Key agreement with the peer key failed.
    #[error("key agreement failed: {0}")]
    KeyAgreement(#[from] stowage_identity::IdentityError),
}

/// Errors raised by the sync protocol.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The frame kind is inside the sync range but not a known message.
    #[error("unknown sync message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// DATA or END_ID arrived while no repository was open.
    #[error("received {0} without an open repository")]
    NoOpenTarget(&'static str),

    /// END_ID named a different repository than the open one.
    #[error("END_ID for {got} while {expected} is open")]
    MismatchedEnd {
        /// The id that is open.
        expected: String,
        /// The id named by END_ID.
        got: String,
    },

    /// The frame payload could not be parsed.
    #[error("malformed sync message: {0}")]
    Malformed(String),

    /// Listing local repositories failed.
    #[error("failed to enumerate repositories: {0}")]
    Enumerate(#[source] std::io::Error),

    /// Reading or writing one repository failed.
    #[error("transfer of repository {id} failed: {source}")]
    Stream {
        /// The repository whose transfer failed.
        id: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    /// Whether the error must end the session.
    ///
    /// Stream errors only affect a single repository.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }
}

/// Errors on a framed connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeds the size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// The announced size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// A frame of a kind not valid at this point of the session.
    #[error("unexpected frame kind {0:#04x}")]
    UnexpectedFrame(u8),

    /// The frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The peer closed the connection early.
    #[error("connection closed")]
    Closed,

    /// Handshake failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Sync failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
