//! Mutual authentication of two nodes over an untrusted connection.
//!
//! Both sides know their own keypair and the public key the peer claims.
//! They derive the same X25519 shared secret only if both claims are true.
//! The initiator encrypts a random challenge under that secret; each side
//! must send back a deterministic mutation of what it decrypted:
//!
//! ```text
//! initiator                                     responder
//!   CHALLENGE [0x01][iv: 16][len: u16][E(iv, c)]  ->
//!            <-  RESPONSE [0x02][len: u16][E(iv', m1(c))]
//!   FINALIZE [0x03][len: u16][E(iv'', m2(m1(c)))] ->
//! ```
//!
//! where `iv' = m1(iv)` and `iv'' = m2(iv')`. The initiator authenticates
//! the responder when checking RESPONSE and the responder authenticates the
//! initiator when checking FINALIZE.
//!
//! The cipher is ChaCha20 keyed with the shared secret, with the nonce taken
//! from the first 12 bytes of SHA-256 over the 16-byte IV.

use crate::AuthError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::RngCore;
use sha2::{Digest, Sha256};
use stowage_identity::{Keypair, PublicKey, SharedSecret};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, AuthError>;

/// Default number of random challenge bytes.
pub const DEFAULT_CHALLENGE_SIZE: usize = 32;

/// Size of the IV carried in a CHALLENGE.
pub const IV_LEN: usize = 16;

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMessageType {
    /// Encrypted challenge from the initiator.
    Challenge = 0x01,
    /// Mutated challenge from the responder.
    Response = 0x02,
    /// Twice mutated challenge from the initiator.
    Finalize = 0x03,
}

impl AuthMessageType {
    /// Parses a message type byte.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownMessageType`] for any other byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Challenge),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Finalize),
            other => Err(AuthError::UnknownMessageType(other)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Challenge => "CHALLENGE",
            Self::Response => "RESPONSE",
            Self::Finalize => "FINALIZE",
        }
    }
}

/// Which mutation to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateStep {
    /// Increment the byte at `buf[0] % len`.
    One,
    /// Increment the byte at `buf[buf[0] % len] % len`.
    Two,
}

/// Returns a copy of `buffer` with exactly one byte incremented (mod 256).
///
/// An empty buffer is returned unchanged.
#[must_use]
pub fn mutate(buffer: &[u8], step: MutateStep) -> Vec<u8> {
    let mut result = buffer.to_vec();
    let Some(&first) = buffer.first() else {
        return result;
    };

    let len = buffer.len();
    let offset = usize::from(first) % len;
    let target = match step {
        MutateStep::One => offset,
        MutateStep::Two => usize::from(buffer[offset]) % len,
    };
    result[target] = result[target].wrapping_add(1);
    result
}

/// Encrypts or decrypts `data` in place.
fn apply_cipher(secret: &SharedSecret, iv: &[u8; IV_LEN], data: &mut [u8]) {
    let digest = Sha256::digest(iv);
    let key = chacha20::Key::from_slice(secret.as_bytes());
    let nonce = chacha20::Nonce::from_slice(&digest[..12]);

    let mut cipher = ChaCha20::new(key, nonce);
    cipher.apply_keystream(data);
}

fn mutate_iv(iv: &[u8; IV_LEN], step: MutateStep) -> [u8; IV_LEN] {
    let mut out = [0u8; IV_LEN];
    out.copy_from_slice(&mutate(iv, step));
    out
}

fn encode(kind: AuthMessageType, iv: Option<&[u8; IV_LEN]>, ciphertext: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + IV_LEN + 2 + ciphertext.len());
    buf.put_u8(kind as u8);
    if let Some(iv) = iv {
        buf.put_slice(iv);
    }
    // Challenge size is capped at u16::MAX when the authenticator is built.
    buf.put_u16(ciphertext.len() as u16);
    buf.put_slice(ciphertext);
    buf.freeze()
}

/// A parsed handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    /// The message type.
    pub kind: AuthMessageType,
    /// The IV, present on CHALLENGE only.
    pub iv: Option<[u8; IV_LEN]>,
    /// The encrypted payload.
    pub ciphertext: Vec<u8>,
}

impl AuthMessage {
    /// Parses a raw handshake message.
    ///
    /// # Errors
    ///
    /// Fails on an unknown type, a truncated message, a length field that
    /// does not match the payload, or an empty payload.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut buf = raw;
        if !buf.has_remaining() {
            return Err(AuthError::Malformed("empty message".into()));
        }
        let kind = AuthMessageType::from_u8(buf.get_u8())?;

        let iv = if kind == AuthMessageType::Challenge {
            if buf.remaining() < IV_LEN {
                return Err(AuthError::Malformed("truncated IV".into()));
            }
            let mut iv = [0u8; IV_LEN];
            buf.copy_to_slice(&mut iv);
            Some(iv)
        } else {
            None
        };

        if buf.remaining() < 2 {
            return Err(AuthError::Malformed("missing length".into()));
        }
        let len = usize::from(buf.get_u16());
        if len == 0 || buf.remaining() != len {
            return Err(AuthError::Malformed(format!(
                "ciphertext length {len} does not match {} remaining bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            kind,
            iv,
            ciphertext: buf.to_vec(),
        })
    }
}

enum State {
    Idle,
    ChallengeSent {
        iv: [u8; IV_LEN],
        challenge: Vec<u8>,
    },
    ResponseSent {
        iv: [u8; IV_LEN],
        challenge: Vec<u8>,
    },
    Authenticated,
    Failed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ChallengeSent { .. } => "ChallengeSent",
            Self::ResponseSent { .. } => "ResponseSent",
            Self::Authenticated => "Authenticated",
            Self::Failed => "Failed",
        }
    }
}

/// One side of the mutual authentication handshake.
///
/// Instances are connection-scoped. Either side may call
/// [`initiate`](Self::initiate); every message received from the peer goes
/// through [`consume`](Self::consume), which returns the reply to send, if
/// any. Any error leaves the authenticator in a failed state.
pub struct MutualAuthenticator {
    secret: SharedSecret,
    challenge_size: usize,
    peer_id: String,
    state: State,
    peer_authenticated: bool,
}

impl MutualAuthenticator {
    /// Creates an authenticator for talking to `peer` as `own`.
    ///
    /// # Errors
    ///
    /// Fails if `challenge_size` is zero or above 65535, or if key
    /// agreement with `peer` is impossible.
    pub fn new(own: &Keypair, peer: &PublicKey, challenge_size: usize) -> Result<Self> {
        if challenge_size == 0 || challenge_size > usize::from(u16::MAX) {
            return Err(AuthError::InvalidChallengeSize(challenge_size));
        }

        let secret = own.diffie_hellman(peer)?;
        Ok(Self {
            secret,
            challenge_size,
            peer_id: peer.short_id(),
            state: State::Idle,
            peer_authenticated: false,
        })
    }

    /// Whether the peer has proven possession of its key.
    #[must_use]
    pub fn peer_authenticated(&self) -> bool {
        self.peer_authenticated
    }

    /// Whether the handshake has run to completion on this side.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Authenticated)
    }

    /// Whether a previous message failed the handshake.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Drops any in-flight handshake state.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.peer_authenticated = false;
    }

    /// Starts a new handshake and returns the CHALLENGE to send.
    ///
    /// Any handshake in progress is discarded.
    pub fn initiate(&mut self) -> Bytes {
        let mut rng = rand::thread_rng();
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        let mut challenge = vec![0u8; self.challenge_size];
        rng.fill_bytes(&mut challenge);

        let mut ciphertext = challenge.clone();
        apply_cipher(&self.secret, &iv, &mut ciphertext);

        debug!(peer = %self.peer_id, size = self.challenge_size, "sending challenge");
        self.peer_authenticated = false;
        self.state = State::ChallengeSent { iv, challenge };
        encode(AuthMessageType::Challenge, Some(&iv), &ciphertext)
    }

    /// Processes a message from the peer, returning the reply if one is due.
    ///
    /// # Errors
    ///
    /// Fails on unknown or malformed messages, messages out of order, and
    /// verification mismatches. The authenticator is then failed until the
    /// next CHALLENGE or [`initiate`](Self::initiate).
    pub fn consume(&mut self, raw: &[u8]) -> Result<Option<Bytes>> {
        let result = AuthMessage::parse(raw).and_then(|message| match message.kind {
            AuthMessageType::Challenge => self.handle_challenge(&message).map(Some),
            AuthMessageType::Response => self.handle_response(&message).map(Some),
            AuthMessageType::Finalize => self.handle_finalize(&message).map(|()| None),
        });

        if let Err(e) = &result {
            warn!(peer = %self.peer_id, error = %e, "mutual authentication failed");
            self.state = State::Failed;
            self.peer_authenticated = false;
        }
        result
    }

    fn handle_challenge(&mut self, message: &AuthMessage) -> Result<Bytes> {
        if !matches!(self.state, State::Idle) {
            debug!(peer = %self.peer_id, state = self.state.name(), "challenge restarts handshake");
        }
        self.reset();

        let iv = message
            .iv
            .ok_or_else(|| AuthError::Malformed("challenge without IV".into()))?;

        let mut challenge = message.ciphertext.clone();
        apply_cipher(&self.secret, &iv, &mut challenge);

        let response_iv = mutate_iv(&iv, MutateStep::One);
        let mut ciphertext = mutate(&challenge, MutateStep::One);
        apply_cipher(&self.secret, &response_iv, &mut ciphertext);

        debug!(peer = %self.peer_id, "answering challenge");
        self.state = State::ResponseSent { iv, challenge };
        Ok(encode(AuthMessageType::Response, None, &ciphertext))
    }

    fn handle_response(&mut self, message: &AuthMessage) -> Result<Bytes> {
        let State::ChallengeSent { iv, challenge } = &self.state else {
            return Err(self.unexpected(message.kind));
        };

        let response_iv = mutate_iv(iv, MutateStep::One);
        let mut candidate = message.ciphertext.clone();
        apply_cipher(&self.secret, &response_iv, &mut candidate);

        if candidate != mutate(challenge, MutateStep::One) {
            return Err(AuthError::AuthenticationFailed);
        }
        self.peer_authenticated = true;

        let finalize_iv = mutate_iv(&response_iv, MutateStep::Two);
        let mut ciphertext = mutate(&candidate, MutateStep::Two);
        apply_cipher(&self.secret, &finalize_iv, &mut ciphertext);

        debug!(peer = %self.peer_id, "peer authenticated, finalizing");
        self.state = State::Authenticated;
        Ok(encode(AuthMessageType::Finalize, None, &ciphertext))
    }

    fn handle_finalize(&mut self, message: &AuthMessage) -> Result<()> {
        let State::ResponseSent { iv, challenge } = &self.state else {
            return Err(self.unexpected(message.kind));
        };

        let response_iv = mutate_iv(iv, MutateStep::One);
        let finalize_iv = mutate_iv(&response_iv, MutateStep::Two);
        let mut candidate = message.ciphertext.clone();
        apply_cipher(&self.secret, &finalize_iv, &mut candidate);

        let expected = mutate(&mutate(challenge, MutateStep::One), MutateStep::Two);
        if candidate != expected {
            return Err(AuthError::AuthenticationFailed);
        }

        debug!(peer = %self.peer_id, "peer authenticated");
        self.peer_authenticated = true;
        self.state = State::Authenticated;
        Ok(())
    }

    fn unexpected(&self, kind: AuthMessageType) -> AuthError {
        AuthError::UnexpectedMessage {
            message: kind.name(),
            state: self.state.name(),
        }
    }
}

impl std::fmt::Debug for MutualAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualAuthenticator")
            .field("peer", &self.peer_id)
            .field("state", &self.state.name())
            .field("peer_authenticated", &self.peer_authenticated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn pair(challenge_size: usize) -> (MutualAuthenticator, MutualAuthenticator) {
        let a = Keypair::generate();
        let b = Keypair::generate();
        (
            MutualAuthenticator::new(&a, &b.public_key(), challenge_size).unwrap(),
            MutualAuthenticator::new(&b, &a.public_key(), challenge_size).unwrap(),
        )
    }

    #[test]
    fn three_messages_authenticate_both_sides() {
        let (mut a, mut b) = pair(DEFAULT_CHALLENGE_SIZE);

        let challenge = a.initiate();
        assert_eq!(challenge[0], AuthMessageType::Challenge as u8);
        assert_eq!(challenge.len(), 1 + IV_LEN + 2 + DEFAULT_CHALLENGE_SIZE);

        let response = b.consume(&challenge).unwrap().unwrap();
        assert_eq!(response[0], AuthMessageType::Response as u8);
        assert!(!b.peer_authenticated());

        let finalize = a.consume(&response).unwrap().unwrap();
        assert_eq!(finalize[0], AuthMessageType::Finalize as u8);
        assert!(a.peer_authenticated());

        assert!(b.consume(&finalize).unwrap().is_none());
        assert!(b.peer_authenticated());
        assert!(a.is_complete() && b.is_complete());
    }

    #[test]
    fn wrong_private_key_fails_at_response() {
        let a_claimed = Keypair::generate();
        let a_actual = Keypair::generate();
        let b = Keypair::generate();

        let mut a = MutualAuthenticator::new(&a_actual, &b.public_key(), 8).unwrap();
        let mut b = MutualAuthenticator::new(&b, &a_claimed.public_key(), 8).unwrap();

        let challenge = a.initiate();
        let response = b.consume(&challenge).unwrap().unwrap();
        assert!(matches!(
            a.consume(&response),
            Err(AuthError::AuthenticationFailed)
        ));

        assert!(!a.peer_authenticated());
        assert!(!b.peer_authenticated());
        assert!(a.is_failed());
    }

    #[test]
    fn tampered_finalize_is_rejected() {
        let (mut a, mut b) = pair(16);
        let response = b.consume(&a.initiate()).unwrap().unwrap();
        let finalize = a.consume(&response).unwrap().unwrap();

        let mut tampered = finalize.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            b.consume(&tampered),
            Err(AuthError::AuthenticationFailed)
        ));
        assert!(!b.peer_authenticated());
    }

    #[test]
    fn out_of_order_messages_fail() {
        let (mut a, mut b) = pair(8);

        let response = b.consume(&a.initiate()).unwrap().unwrap();
        // b sent RESPONSE and must not accept one.
        assert!(matches!(
            b.consume(&response),
            Err(AuthError::UnexpectedMessage {
                message: "RESPONSE",
                state: "ResponseSent"
            })
        ));

        let (mut fresh, _) = pair(8);
        let finalize = [AuthMessageType::Finalize as u8, 0, 1, 0xAA];
        assert!(matches!(
            fresh.consume(&finalize),
            Err(AuthError::UnexpectedMessage { message: "FINALIZE", state: "Idle" })
        ));
    }

    #[test]
    fn unknown_type_and_malformed_messages_fail() {
        let (mut a, _) = pair(8);
        assert!(matches!(
            a.consume(&[0x07, 0, 0]),
            Err(AuthError::UnknownMessageType(0x07))
        ));
        assert!(matches!(a.consume(&[]), Err(AuthError::Malformed(_))));
        assert!(matches!(
            a.consume(&[AuthMessageType::Response as u8, 0, 5, 1]),
            Err(AuthError::Malformed(_))
        ));
        assert!(a.is_failed());
    }

    #[test]
    fn new_challenge_resets_state() {
        let (mut a, mut b) = pair(8);

        let stale = b.consume(&a.initiate()).unwrap().unwrap();
        let _ = a.initiate();
        assert!(matches!(
            a.consume(&stale),
            Err(AuthError::AuthenticationFailed)
        ));

        // A fresh CHALLENGE restarts both sides from any state.
        let response = b.consume(&a.initiate()).unwrap().unwrap();
        let finalize = a.consume(&response).unwrap().unwrap();
        b.consume(&finalize).unwrap();
        assert!(a.peer_authenticated() && b.peer_authenticated());
    }

    #[test]
    fn reset_discards_handshake() {
        let (mut a, mut b) = pair(8);
        let reply = b.consume(&a.initiate()).unwrap().unwrap();
        let finalize = a.consume(&reply).unwrap().unwrap();
        assert!(a.peer_authenticated());

        a.reset();
        b.reset();
        assert!(!a.peer_authenticated() && !a.is_complete());
        assert!(matches!(
            b.consume(&finalize),
            Err(AuthError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn rejects_unusable_challenge_sizes() {
        let a = Keypair::generate();
        let b = Keypair::generate().public_key();
        assert!(MutualAuthenticator::new(&a, &b, 0).is_err());
        assert!(MutualAuthenticator::new(&a, &b, 70_000).is_err());
        assert!(MutualAuthenticator::new(&a, &b, 65_535).is_ok());
    }

    #[test]
    fn mutate_examples() {
        // offset = 2 % 3 = 2
        assert_eq!(mutate(&[2, 5, 255], MutateStep::One), vec![2, 5, 0]);
        // offset = 2, offset2 = 255 % 3 = 0
        assert_eq!(mutate(&[2, 5, 255], MutateStep::Two), vec![3, 5, 255]);
        assert!(mutate(&[], MutateStep::Two).is_empty());
    }

    proptest! {
        #[test]
        fn mutate_changes_exactly_one_byte(buf in prop::collection::vec(any::<u8>(), 1..64), two in any::<bool>()) {
            let step = if two { MutateStep::Two } else { MutateStep::One };
            let out = mutate(&buf, step);
            prop_assert_eq!(out.clone(), mutate(&buf, step));
            prop_assert_eq!(out.len(), buf.len());

            let changed: Vec<usize> = (0..buf.len()).filter(|&i| out[i] != buf[i]).collect();
            prop_assert_eq!(changed.len(), 1);
            let i = changed[0];
            prop_assert_eq!(out[i], buf[i].wrapping_add(1));
        }

        #[test]
        fn cipher_roundtrips(data in prop::collection::vec(any::<u8>(), 0..512), iv in any::<[u8; 16]>()) {
            let a = Keypair::generate();
            let secret = a.diffie_hellman(&Keypair::generate().public_key()).unwrap();

            let mut buf = data.clone();
            apply_cipher(&secret, &iv, &mut buf);
            if data.len() >= 16 {
                prop_assert_ne!(&buf, &data);
            }
            apply_cipher(&secret, &iv, &mut buf);
            prop_assert_eq!(buf, data);
        }
    }
}
