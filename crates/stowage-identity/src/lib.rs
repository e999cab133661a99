//! # Stowage Identity
//!
//! Node identities for Stowage storage nodes.
//!
//! Every node owns an Ed25519 [`Keypair`]. The public half is what the node
//! advertises (on chain and in the DHT); the secret half never leaves the
//! node. Two nodes derive a common [`SharedSecret`] from their keypairs via
//! X25519 on the birationally equivalent Montgomery curve, which is what the
//! mutual authentication protocol builds on.
//!
//! ## Example
//!
//! ```rust
//! use stowage_identity::Keypair;
//!
//! let alice = Keypair::generate();
//! let bob = Keypair::generate();
//!
//! let ab = alice.diffie_hellman(&bob.public_key()).unwrap();
//! let ba = bob.diffie_hellman(&alice.public_key()).unwrap();
//! assert_eq!(ab.as_bytes(), ba.as_bytes());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod keypair;
mod public_key;

pub use error::{IdentityError, Result};
pub use keypair::{Keypair, SharedSecret};
pub use public_key::PublicKey;
