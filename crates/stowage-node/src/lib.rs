//! # Stowage Node
//!
//! A storage node that keeps repositories, finds the other storage
//! providers through the DHT, and replicates repositories with each of them.
//!
//! ## Connection protocol
//!
//! ```text
//! initiator                         responder
//!   HELLO(public key)          ->   checks the provider directory
//!   AUTH(CHALLENGE)            ->
//!                              <-   AUTH(RESPONSE)
//!   AUTH(FINALIZE)             ->
//!   sync frames               <->   sync frames
//! ```
//!
//! Both sides then stream all of their repositories to each other and the
//! connection ends once each side has sent and received FINALIZE.

pub mod config;
pub mod directory;
mod error;
pub mod keys;
pub mod node;
pub mod observability;
pub mod session;
pub mod store;

pub use config::NodeConfig;
pub use directory::{ProviderDirectory, StaticDirectory};
pub use error::{NodeError, Result};
pub use node::{sync_candidates, ConnectionRegistry, Node, NodeOptions, SyncSummary};
pub use session::{Connection, SessionReport};
pub use store::StorageSyncStore;
