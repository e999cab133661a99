//! Fuzz target for sync message decoding.
//!
//! The first byte is the frame kind, the rest the payload.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stowage_protocol::{Frame, SyncMessage};

fuzz_target!(|data: &[u8]| {
    let Some((&kind, payload)) = data.split_first() else {
        return;
    };

    if let Ok(message) = SyncMessage::decode(Frame::new(kind, payload.to_vec())) {
        let frame = message.clone().into_frame();
        assert_eq!(frame.kind, kind);
        assert_eq!(SyncMessage::decode(frame).ok(), Some(message));
    }
});
