//! Fuzz target for Payload::from_frame
//!
//! Arbitrary CBOR bodies under every frame kind, with arbitrary routing
//! fields. Covers malformed CBOR, a body of one kind under another kind's
//! header, and header fields that disagree with the body.
//!
//! Must never panic. A payload that decodes must agree with its header.

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rideflow_proto::{Frame, FrameHeader, FrameKind, Payload, TripId, UserId};

#[derive(Debug, Arbitrary)]
struct Input {
    trip_id: u128,
    sender: u64,
    sequence: u64,
    body: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let kinds = [
        FrameKind::TripEvent,
        FrameKind::ChatMessage,
        FrameKind::ResyncRequest,
        FrameKind::ResyncResponse,
        FrameKind::Ack,
    ];

    for kind in kinds {
        let mut header = FrameHeader::new(kind);
        header.set_trip_id(TripId::new(input.trip_id));
        header.set_sender_id(UserId::new(input.sender));
        header.set_sequence(input.sequence);

        let frame = Frame::new(header, Bytes::copy_from_slice(&input.body));
        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.kind(), kind);
            if let Payload::TripEvent(event) = &payload {
                assert_eq!(event.trip_id, TripId::new(input.trip_id));
            }
        }
    }
});
