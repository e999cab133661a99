//! Fuzz target for frame decoding.
//!
//! Feeds arbitrary bytes to the streaming codec and the one-shot decoder.

#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use stowage_protocol::{Frame, FrameCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let _ = Frame::decode(Bytes::copy_from_slice(data));

    // Small limit so length prefixes are exercised on both sides of it.
    let mut codec = FrameCodec::with_max_size(4096);
    let mut buf = BytesMut::from(data);
    for _ in 0..64 {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                // Whatever decodes must re-encode to the bytes consumed.
                let encoded = frame.encode();
                assert_eq!(Frame::decode(encoded).ok(), Some(frame));
            }
            Ok(None) | Err(_) => break,
        }
    }
});
