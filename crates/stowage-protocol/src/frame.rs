//! Length-prefixed frames.
//!
//! Format:
//! - 1 byte: frame kind
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload

use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size of a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame header.
pub const HEADER_LEN: usize = 5;

/// Frame kinds.
pub mod kind {
    /// Sync: a repository transfer begins.
    pub const START_ID: u8 = 0x00;
    /// Sync: a chunk of repository content.
    pub const DATA: u8 = 0x01;
    /// Sync: a repository transfer ends.
    pub const END_ID: u8 = 0x02;
    /// Sync: the sender has no more repositories.
    pub const FINALIZE: u8 = 0x03;
    /// Last kind reserved for the sync protocol.
    pub const SYNC_RESERVED_END: u8 = FINALIZE + 10;
    /// The initiator announces its public key.
    pub const HELLO: u8 = 0x0E;
    /// A mutual authentication message.
    pub const AUTH: u8 = 0x0F;

    /// Returns `true` if `kind` belongs to the sync protocol.
    #[must_use]
    pub fn is_sync(kind: u8) -> bool {
        kind <= SYNC_RESERVED_END
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame kind.
    pub kind: u8,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    #[must_use]
    pub fn new(kind: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Encodes the frame into a standalone buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes exactly one frame from `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is truncated, too large, or has
    /// trailing bytes.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed("frame too short".into()));
        }

        let kind = data.get_u8();
        let len = data.get_u32() as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if data.len() != len {
            return Err(ProtocolError::Malformed(format!(
                "payload length mismatch: header says {len}, got {}",
                data.len()
            )));
        }

        Ok(Self {
            kind,
            payload: data,
        })
    }
}

/// Codec turning a byte stream into [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_size: usize,
}

impl FrameCodec {
    /// Creates a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a custom payload size limit.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_size {
            return Err(ProtocolError::TooLarge {
                size: len,
                max: self.max_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let kind = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_size {
            return Err(ProtocolError::TooLarge {
                size: frame.payload.len(),
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.kind);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = FrameCodec::new();
        let encoded = Frame::new(kind::DATA, &b"hello"[..]).encode();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, kind::DATA);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_splits_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(kind::START_ID, &b"id"[..]), &mut buf).unwrap();
        codec.encode(Frame::new(kind::FINALIZE, Bytes::new()), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind, kind::START_ID);
        let last = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(last.kind, kind::FINALIZE);
        assert!(last.payload.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_oversized_frame() {
        let mut codec = FrameCodec::with_max_size(4);
        let mut buf = BytesMut::from(&Frame::new(kind::DATA, &b"too big"[..]).encode()[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TooLarge { size: 7, max: 4 })
        ));

        let mut out = BytesMut::new();
        assert!(codec.encode(Frame::new(kind::DATA, &b"too big"[..]), &mut out).is_err());
    }

    #[test]
    fn standalone_decode_rejects_trailing_bytes() {
        let mut raw = BytesMut::from(&Frame::new(kind::HELLO, &b"k"[..]).encode()[..]);
        raw.put_u8(0);
        assert!(Frame::decode(raw.freeze()).is_err());
        assert!(Frame::decode(Bytes::from_static(&[1, 0])).is_err());
    }

    #[test]
    fn sync_range_is_reserved() {
        assert!(kind::is_sync(kind::FINALIZE));
        assert!(kind::is_sync(0x0D));
        assert!(!kind::is_sync(kind::HELLO));
        assert!(!kind::is_sync(kind::AUTH));
    }
}
