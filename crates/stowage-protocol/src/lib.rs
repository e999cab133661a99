//! # Stowage Protocol
//!
//! Wire protocols spoken between two storage nodes over one connection.
//!
//! - [`frame`]: length-prefixed frames shared by every protocol on the
//!   connection.
//! - [`auth`]: the three-message [`MutualAuthenticator`] handshake proving
//!   both sides hold the private key for the public key they advertise.
//! - [`sync`]: the [`SyncProtocol`] streaming every local repository to the
//!   peer while receiving the peer's repositories.
//!
//! Frame kinds `0x00..=0x0D` belong to the sync protocol; `HELLO` and `AUTH`
//! sit above that range so both protocols can share the transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
mod error;
pub mod frame;
pub mod memory;
pub mod sync;

pub use auth::{mutate, AuthMessageType, MutateStep, MutualAuthenticator, DEFAULT_CHALLENGE_SIZE};
pub use error::{AuthError, ProtocolError, Result, SyncError};
pub use frame::{Frame, FrameCodec, MAX_FRAME_SIZE};
pub use memory::MemorySyncStore;
pub use sync::{
    Consumed, Enumerator, SyncMessage, SyncProtocol, SyncReader, SyncReport, SyncStore,
    WriteTarget, DATA_CHUNK_SIZE,
};
