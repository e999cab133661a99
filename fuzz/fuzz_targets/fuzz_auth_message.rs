//! Fuzz target for mutual authentication messages.
//!
//! Parses arbitrary input and pushes it through authenticators in every
//! state; none of them may panic or end up authenticated.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use stowage_identity::Keypair;
use stowage_protocol::auth::AuthMessage;
use stowage_protocol::MutualAuthenticator;

fn keys() -> &'static (Keypair, Keypair) {
    static KEYS: OnceLock<(Keypair, Keypair)> = OnceLock::new();
    KEYS.get_or_init(|| (Keypair::generate(), Keypair::generate()))
}

fuzz_target!(|data: &[u8]| {
    let _ = AuthMessage::parse(data);

    let (own, peer) = keys();
    let Ok(mut idle) = MutualAuthenticator::new(own, &peer.public_key(), 8) else {
        return;
    };
    let _ = idle.consume(data);

    let Ok(mut challenged) = MutualAuthenticator::new(own, &peer.public_key(), 8) else {
        return;
    };
    challenged.initiate();
    let _ = challenged.consume(data);
    assert!(!challenged.peer_authenticated());
});
