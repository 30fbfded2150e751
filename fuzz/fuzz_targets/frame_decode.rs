//! Fuzz target for Frame::decode
//!
//! Arbitrary bytes as a frame. Looks for:
//! - Parser panics
//! - Size arithmetic that overflows
//! - Headers that slip past magic, version, or length checks
//!
//! Decoding must never panic; invalid input returns an error. A frame that
//! decodes is handed on to payload decoding, which must not panic either.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rideflow_proto::{Frame, Payload};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        let _ = Payload::from_frame(&frame);
    }
});
