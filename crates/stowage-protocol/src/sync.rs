//! Repository synchronization.
//!
//! Each side streams every local repository to the other:
//!
//! ```text
//! START_ID(id) DATA* END_ID(id)   for each local id, one at a time
//! FINALIZE                        once all ids were sent
//! ```
//!
//! Ids travel as UTF-8 payloads. The receiving side opens one write target
//! per START_ID and commits it on END_ID. A transfer that is interrupted by
//! another START_ID or by FINALIZE is discarded, so a sender that fails to
//! read a repository simply never sends END_ID for it.

use crate::frame::{kind, Frame};
use crate::{ProtocolError, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

/// Maximum size of a DATA chunk.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// A byte stream over one repository's content.
pub type SyncReader = Pin<Box<dyn AsyncRead + Send>>;

/// Local repositories as seen by the sync protocol.
#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    /// Lists the ids to send, in sending order.
    async fn ids(&self) -> io::Result<Vec<String>>;

    /// Opens the content of `id` for sending.
    async fn read_open(&self, id: &str) -> io::Result<SyncReader>;

    /// Opens a target receiving the content of `id`.
    async fn write_open(&self, id: &str) -> io::Result<Box<dyn WriteTarget>>;
}

/// Destination of one received repository.
#[async_trait]
pub trait WriteTarget: Send {
    /// Writes one chunk of content.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Completes the transfer; only now may the content become visible.
    async fn commit(self: Box<Self>) -> io::Result<()>;

    /// Drops the transfer without making anything visible.
    async fn abort(self: Box<Self>);
}

/// A decoded sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// A repository transfer begins.
    StartId(String),
    /// Content chunk of the open repository.
    Data(Bytes),
    /// The repository transfer ends.
    EndId(String),
    /// No more repositories follow.
    Finalize,
}

impl SyncMessage {
    /// Decodes a frame of the sync range.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownMessageType`] for unassigned kinds and
    /// [`SyncError::Malformed`] for ids that are not UTF-8.
    pub fn decode(frame: Frame) -> Result<Self, SyncError> {
        let id = |payload: &Bytes| {
            std::str::from_utf8(payload)
                .map(str::to_string)
                .map_err(|e| SyncError::Malformed(format!("repository id is not UTF-8: {e}")))
        };

        match frame.kind {
            kind::START_ID => Ok(Self::StartId(id(&frame.payload)?)),
            kind::DATA => Ok(Self::Data(frame.payload)),
            kind::END_ID => Ok(Self::EndId(id(&frame.payload)?)),
            kind::FINALIZE => Ok(Self::Finalize),
            other => Err(SyncError::UnknownMessageType(other)),
        }
    }

    /// Encodes the message as a frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        match self {
            Self::StartId(id) => Frame::new(kind::START_ID, id.into_bytes()),
            Self::Data(chunk) => Frame::new(kind::DATA, chunk),
            Self::EndId(id) => Frame::new(kind::END_ID, id.into_bytes()),
            Self::Finalize => Frame::new(kind::FINALIZE, Bytes::new()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::StartId(_) => "START_ID",
            Self::Data(_) => "DATA",
            Self::EndId(_) => "END_ID",
            Self::Finalize => "FINALIZE",
        }
    }
}

/// Outcome of one [`Enumerator::run`].
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Ids sent completely, in order.
    pub sent: Vec<String>,
    /// Ids that could not be read, with the error.
    pub failed: Vec<SyncError>,
}

/// The sending half of a sync session.
///
/// Only one exists per [`SyncProtocol`]; it holds at most one open read
/// stream at a time.
pub struct Enumerator<S> {
    store: Arc<S>,
    chunk_size: usize,
}

impl<S: SyncStore> Enumerator<S> {
    /// Streams every local repository into `sink`, then FINALIZE.
    ///
    /// A repository that cannot be read is skipped and listed in the report;
    /// the peer discards whatever part of it was sent.
    ///
    /// # Errors
    ///
    /// Returns the first sink error; nothing more is sent after it.
    pub async fn run<K>(self, mut sink: K) -> Result<SyncReport, ProtocolError>
    where
        K: Sink<Frame, Error = ProtocolError> + Unpin,
    {
        let mut report = SyncReport::default();
        let mut buf = vec![0u8; self.chunk_size];

        let ids = match self.store.ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cannot enumerate repositories, sending none");
                report.failed.push(SyncError::Enumerate(e));
                Vec::new()
            }
        };

        for id in ids {
            let mut reader = match self.store.read_open(&id).await {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(repo = %id, error = %e, "cannot open repository for sync");
                    report.failed.push(SyncError::Stream { id, source: e });
                    continue;
                }
            };

            sink.send(SyncMessage::StartId(id.clone()).into_frame()).await?;

            let mut bytes = 0u64;
            let failure = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => {
                        bytes += n as u64;
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        sink.send(SyncMessage::Data(chunk).into_frame()).await?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Some(e),
                }
            };

            match failure {
                None => {
                    sink.send(SyncMessage::EndId(id.clone()).into_frame()).await?;
                    debug!(repo = %id, bytes, "sent repository");
                    report.sent.push(id);
                }
                Some(e) => {
                    warn!(repo = %id, error = %e, "read failed mid-transfer, peer will discard");
                    report.failed.push(SyncError::Stream { id, source: e });
                }
            }
        }

        sink.send(SyncMessage::Finalize.into_frame()).await?;
        info!(
            sent = report.sent.len(),
            failed = report.failed.len(),
            "finished sending repositories"
        );
        Ok(report)
    }
}

/// What [`SyncProtocol::consume`] produced.
pub struct Consumed<S> {
    /// The local enumerator, handed out on the first inbound message if this
    /// side had not initiated yet. The caller must run it.
    pub outbound: Option<Enumerator<S>>,
    /// The peer sent FINALIZE.
    pub finished: bool,
    /// A single repository failed to be received; the session goes on.
    pub failure: Option<SyncError>,
}

impl<S> Consumed<S> {
    fn new(outbound: Option<Enumerator<S>>) -> Self {
        Self {
            outbound,
            finished: false,
            failure: None,
        }
    }
}

enum WriteSlot {
    Idle,
    Open {
        id: String,
        target: Box<dyn WriteTarget>,
        bytes: u64,
    },
    /// A write failed; the rest of this id is dropped until END_ID.
    Poisoned {
        id: String,
    },
}

/// Connection-scoped state of the sync protocol.
pub struct SyncProtocol<S> {
    store: Arc<S>,
    initiated: bool,
    chunk_size: usize,
    slot: WriteSlot,
}

impl<S: SyncStore> SyncProtocol<S> {
    /// Creates the protocol over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            initiated: false,
            chunk_size: DATA_CHUNK_SIZE,
            slot: WriteSlot::Idle,
        }
    }

    /// Overrides the DATA chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Claims the sending side. Returns `None` if it was already claimed.
    pub fn initiate(&mut self) -> Option<Enumerator<S>> {
        if self.initiated {
            return None;
        }
        self.initiated = true;
        Some(Enumerator {
            store: Arc::clone(&self.store),
            chunk_size: self.chunk_size,
        })
    }

    /// Processes one inbound sync frame.
    ///
    /// # Errors
    ///
    /// Returns fatal protocol errors: unknown kinds, malformed payloads,
    /// DATA or END_ID without an open repository and mismatched END_ID.
    /// Failures of a single repository are reported in
    /// [`Consumed::failure`] instead.
    pub async fn consume(&mut self, frame: Frame) -> Result<Consumed<S>, SyncError> {
        let mut consumed = Consumed::new(self.initiate());
        let message = SyncMessage::decode(frame)?;
        trace!(message = message.name(), "consuming sync message");

        match message {
            SyncMessage::StartId(id) => {
                self.discard("START_ID").await;
                match self.store.write_open(&id).await {
                    Ok(target) => {
                        debug!(repo = %id, "receiving repository");
                        self.slot = WriteSlot::Open {
                            id,
                            target,
                            bytes: 0,
                        };
                    }
                    Err(e) => {
                        warn!(repo = %id, error = %e, "cannot open repository for writing");
                        self.slot = WriteSlot::Poisoned { id: id.clone() };
                        consumed.failure = Some(SyncError::Stream { id, source: e });
                    }
                }
            }
            SyncMessage::Data(chunk) => {
                let written = match &mut self.slot {
                    WriteSlot::Open { target, bytes, .. } => {
                        let result = target.write(&chunk).await;
                        if result.is_ok() {
                            *bytes += chunk.len() as u64;
                        }
                        result
                    }
                    WriteSlot::Poisoned { .. } => Ok(()),
                    WriteSlot::Idle => return Err(SyncError::NoOpenTarget("DATA")),
                };
                if let Err(e) = written {
                    consumed.failure = Some(self.poison(e).await);
                }
            }
            SyncMessage::EndId(end) => match std::mem::replace(&mut self.slot, WriteSlot::Idle) {
                WriteSlot::Open { id, target, bytes } => {
                    if id != end {
                        target.abort().await;
                        return Err(SyncError::MismatchedEnd { expected: id, got: end });
                    }
                    match target.commit().await {
                        Ok(()) => info!(repo = %id, bytes, "received repository"),
                        Err(e) => {
                            warn!(repo = %id, error = %e, "committing repository failed");
                            consumed.failure = Some(SyncError::Stream { id, source: e });
                        }
                    }
                }
                WriteSlot::Poisoned { id } => {
                    if id != end {
                        return Err(SyncError::MismatchedEnd { expected: id, got: end });
                    }
                }
                WriteSlot::Idle => return Err(SyncError::NoOpenTarget("END_ID")),
            },
            SyncMessage::Finalize => {
                self.discard("FINALIZE").await;
                consumed.finished = true;
            }
        }

        Ok(consumed)
    }

    /// Aborts an interrupted transfer, if any.
    async fn discard(&mut self, cause: &'static str) {
        match std::mem::replace(&mut self.slot, WriteSlot::Idle) {
            WriteSlot::Open { id, target, bytes } => {
                warn!(repo = %id, bytes, cause, "discarding interrupted repository transfer");
                target.abort().await;
            }
            WriteSlot::Poisoned { .. } | WriteSlot::Idle => {}
        }
    }

    async fn poison(&mut self, source: io::Error) -> SyncError {
        let id = match std::mem::replace(&mut self.slot, WriteSlot::Idle) {
            WriteSlot::Open { id, target, .. } => {
                target.abort().await;
                id
            }
            WriteSlot::Poisoned { id } => id,
            WriteSlot::Idle => String::new(),
        };

        warn!(repo = %id, error = %source, "write failed, dropping rest of repository");
        self.slot = WriteSlot::Poisoned { id: id.clone() };
        SyncError::Stream { id, source }
    }
}

impl<S> std::fmt::Debug for SyncProtocol<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = match &self.slot {
            WriteSlot::Idle => "idle".to_string(),
            WriteSlot::Open { id, .. } => format!("open({id})"),
            WriteSlot::Poisoned { id } => format!("poisoned({id})"),
        };
        f.debug_struct("SyncProtocol")
            .field("initiated", &self.initiated)
            .field("slot", &slot)
            .finish_non_exhaustive()
    }
}
