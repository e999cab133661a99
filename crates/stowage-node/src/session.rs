//! One authenticated connection between two storage nodes.
//!
//! A session runs in two phases over a single framed transport:
//!
//! 1. Handshake: the initiator sends HELLO with its public key, then both
//!    sides run the mutual authenticator over AUTH frames.
//! 2. Exchange: both sides stream their repositories to each other with the
//!    sync protocol until each has received the other's FINALIZE.

use crate::{NodeError, ProviderDirectory, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use stowage_identity::{Keypair, PublicKey};
use stowage_protocol::frame::kind;
use stowage_protocol::{
    Frame, FrameCodec, MutualAuthenticator, ProtocolError, SyncError, SyncProtocol, SyncReport,
    SyncStore,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

type Reader<T> = FramedRead<ReadHalf<T>, FrameCodec>;
type Writer<T> = FramedWrite<WriteHalf<T>, FrameCodec>;

/// Outcome of a finished exchange.
#[derive(Debug)]
pub struct SessionReport {
    /// The authenticated peer.
    pub peer: PublicKey,
    /// What this side sent.
    pub outbound: SyncReport,
    /// Repositories from the peer that could not be stored.
    pub inbound_failures: Vec<SyncError>,
}

/// A connection whose peer has been authenticated.
pub struct Connection<T> {
    reader: Reader<T>,
    writer: Writer<T>,
    peer: PublicKey,
}

async fn next_frame<T: AsyncRead>(reader: &mut Reader<T>) -> Result<Frame> {
    match reader.next().await {
        Some(frame) => Ok(frame?),
        None => Err(ProtocolError::Closed.into()),
    }
}

async fn expect_frame<T: AsyncRead>(reader: &mut Reader<T>, expected: u8) -> Result<Bytes> {
    let frame = next_frame(reader).await?;
    if frame.kind != expected {
        return Err(ProtocolError::UnexpectedFrame(frame.kind).into());
    }
    Ok(frame.payload)
}

fn framed<T>(io: T) -> (Reader<T>, Writer<T>)
where
    T: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(io);
    (
        FramedRead::new(read, FrameCodec::new()),
        FramedWrite::new(write, FrameCodec::new()),
    )
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Authenticates to `peer` over a freshly opened transport.
    ///
    /// # Errors
    ///
    /// Fails if the transport breaks, the peer answers out of order, or the
    /// peer cannot prove it holds the key for `peer`.
    pub async fn connect_as_initiator(
        io: T,
        own: &Keypair,
        peer: &PublicKey,
        challenge_size: usize,
    ) -> Result<Self> {
        let (mut reader, mut writer) = framed(io);
        let mut auth = MutualAuthenticator::new(own, peer, challenge_size)?;

        writer
            .send(Frame::new(kind::HELLO, own.public_key().as_bytes().to_vec()))
            .await?;
        writer.send(Frame::new(kind::AUTH, auth.initiate())).await?;

        let response = expect_frame(&mut reader, kind::AUTH).await?;
        if let Some(finalize) = auth.consume(&response)? {
            writer.send(Frame::new(kind::AUTH, finalize)).await?;
        }

        if !auth.peer_authenticated() {
            return Err(NodeError::NotAuthenticated {
                peer: peer.short_id(),
            });
        }

        debug!(peer = %peer.short_id(), "authenticated as initiator");
        Ok(Self {
            reader,
            writer,
            peer: *peer,
        })
    }

    /// Authenticates an incoming connection.
    ///
    /// Only peers listed in `directory` get past HELLO.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Unauthorized`] for unknown peers and
    /// [`NodeError::NotAuthenticated`] if the handshake does not prove the
    /// peer's identity.
    pub async fn accept_as_responder(
        io: T,
        own: &Keypair,
        directory: &dyn ProviderDirectory,
        challenge_size: usize,
    ) -> Result<Self> {
        let (mut reader, mut writer) = framed(io);

        let hello = expect_frame(&mut reader, kind::HELLO).await?;
        let peer = PublicKey::from_bytes(&hello)?;
        if !directory.is_storage_provider(&peer).await? {
            warn!(peer = %peer.short_id(), "rejecting connection from non-provider");
            return Err(NodeError::Unauthorized {
                peer: peer.short_id(),
            });
        }

        let mut auth = MutualAuthenticator::new(own, &peer, challenge_size)?;
        while !auth.is_complete() {
            let message = expect_frame(&mut reader, kind::AUTH).await?;
            if let Some(reply) = auth.consume(&message)? {
                writer.send(Frame::new(kind::AUTH, reply)).await?;
            }
        }

        if !auth.peer_authenticated() {
            return Err(NodeError::NotAuthenticated {
                peer: peer.short_id(),
            });
        }

        debug!(peer = %peer.short_id(), "authenticated as responder");
        Ok(Self {
            reader,
            writer,
            peer,
        })
    }

    /// The authenticated peer.
    #[must_use]
    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    /// Exchanges repositories with the peer.
    ///
    /// With `initiate` set this side starts sending at once; otherwise it
    /// starts on the first sync frame from the peer. Returns once the peer's
    /// FINALIZE has been received and everything local has been sent.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, fatal sync errors and non-sync frames.
    /// Failures of single repositories are listed in the report instead.
    pub async fn exchange<S: SyncStore>(
        self,
        store: Arc<S>,
        initiate: bool,
    ) -> Result<SessionReport> {
        let Self {
            mut reader,
            writer,
            peer,
        } = self;

        let mut exchange = Exchange {
            protocol: SyncProtocol::new(store),
            writer: Some(writer),
            outbound: None,
            inbound_failures: Vec::new(),
        };
        if initiate {
            exchange.start_outbound(None);
        }

        if let Err(e) = exchange.receive(&mut reader).await {
            if let Some(task) = exchange.outbound.take() {
                task.abort();
            }
            return Err(e);
        }

        let outbound = match exchange.outbound.take() {
            Some(task) => task.await.map_err(std::io::Error::other)??,
            None => SyncReport::default(),
        };

        info!(
            peer = %peer.short_id(),
            sent = outbound.sent.len(),
            send_failures = outbound.failed.len(),
            receive_failures = exchange.inbound_failures.len(),
            "sync session finished"
        );
        Ok(SessionReport {
            peer,
            outbound,
            inbound_failures: exchange.inbound_failures,
        })
    }
}

struct Exchange<S, T> {
    protocol: SyncProtocol<S>,
    writer: Option<Writer<T>>,
    outbound: Option<JoinHandle<std::result::Result<SyncReport, ProtocolError>>>,
    inbound_failures: Vec<SyncError>,
}

impl<S, T> Exchange<S, T>
where
    S: SyncStore,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Spawns the sending half, claiming it from the protocol unless the
    /// caller already holds it.
    fn start_outbound(&mut self, enumerator: Option<stowage_protocol::Enumerator<S>>) {
        let Some(enumerator) = enumerator.or_else(|| self.protocol.initiate()) else {
            return;
        };
        if let Some(writer) = self.writer.take() {
            self.outbound = Some(tokio::spawn(enumerator.run(writer)));
        }
    }

    async fn receive(&mut self, reader: &mut Reader<T>) -> Result<()> {
        loop {
            let frame = next_frame(reader).await?;
            if !kind::is_sync(frame.kind) {
                return Err(ProtocolError::UnexpectedFrame(frame.kind).into());
            }

            let consumed = self.protocol.consume(frame).await?;
            if consumed.outbound.is_some() {
                self.start_outbound(consumed.outbound);
            }
            if let Some(failure) = consumed.failure {
                self.inbound_failures.push(failure);
            }
            if consumed.finished {
                return Ok(());
            }
        }
    }
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
