//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary, payloads are CBOR. The header's `kind` byte
//! already identifies the payload type, so only the inner struct is encoded
//! (no variant tag).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one [`FrameKind`]. The header routing
//! fields (`trip_id`, `sequence`, and for chat `sender_id`) always agree with
//! the payload: [`Payload::into_frame`] derives them and
//! [`Payload::from_frame`] rejects frames where they disagree.

mod sync;

use bytes::BufMut;
pub use sync::{Ack, ResyncRequest, ResyncResponse, StreamKind};

use crate::{
    ChatMessage, Frame, FrameHeader, FrameKind, TripEvent, TripId, UserId,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Versioned trip transition
    TripEvent(TripEvent),
    /// Chat message
    ChatMessage(ChatMessage),
    /// Request to re-emit stream state
    ResyncRequest(ResyncRequest),
    /// Trip snapshot
    ResyncResponse(ResyncResponse),
    /// Cumulative acknowledgement
    Ack(Ack),
}

impl Payload {
    /// Frame kind corresponding to this payload type.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::TripEvent(_) => FrameKind::TripEvent,
            Self::ChatMessage(_) => FrameKind::ChatMessage,
            Self::ResyncRequest(_) => FrameKind::ResyncRequest,
            Self::ResyncResponse(_) => FrameKind::ResyncResponse,
            Self::Ack(_) => FrameKind::Ack,
        }
    }

    /// Value carried in the header `sequence` field.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::TripEvent(event) => event.version,
            Self::ChatMessage(message) => message.sequence_number,
            Self::ResyncRequest(request) => request.after,
            Self::ResyncResponse(response) => response.trip.version,
            Self::Ack(ack) => ack.up_to,
        }
    }

    /// Encode payload to buffer.
    ///
    /// Serializes only the inner struct, not the variant tag. Size limits are
    /// enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::TripEvent(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ChatMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ResyncRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ResyncResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ack(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload bytes of the given kind.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(kind: FrameKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match kind {
            FrameKind::TripEvent => Self::TripEvent(decode_cbor(bytes)?),
            FrameKind::ChatMessage => Self::ChatMessage(decode_cbor(bytes)?),
            FrameKind::ResyncRequest => Self::ResyncRequest(decode_cbor(bytes)?),
            FrameKind::ResyncResponse => Self::ResyncResponse(decode_cbor(bytes)?),
            FrameKind::Ack => Self::Ack(decode_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame.
    ///
    /// Sets `kind`, `trip_id`, `sequence`, and `sender_id` in the header and
    /// computes `payload_size`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, trip_id: TripId, sender: UserId) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;

        let mut header = FrameHeader::new(self.kind());
        header.set_trip_id(trip_id);
        header.set_sequence(self.sequence());
        header.set_sender_id(sender);

        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownKind` if the header kind is unrecognized
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::HeaderMismatch` if header routing fields disagree with
    ///   the payload
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let header = &frame.header;
        let kind = header.kind().ok_or(ProtocolError::UnknownKind(header.kind_raw()))?;
        let payload = Self::decode(kind, &frame.payload)?;

        check_field("sequence", header.sequence(), payload.sequence())?;

        match &payload {
            Self::TripEvent(event) => check_field("trip_id", header.trip_id(), event.trip_id)?,
            Self::ChatMessage(message) => {
                check_field("trip_id", header.trip_id(), message.trip_id)?;
                check_field("sender_id", header.sender_id(), message.sender)?;
            },
            Self::ResyncResponse(response) => {
                check_field("trip_id", header.trip_id(), response.trip.id)?;
            },
            Self::ResyncRequest(_) | Self::Ack(_) => {},
        }

        Ok(payload)
    }
}

fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

fn check_field<T: PartialEq + std::fmt::Display>(
    field: &'static str,
    header: T,
    payload: T,
) -> Result<()> {
    if header == payload {
        Ok(())
    } else {
        Err(ProtocolError::HeaderMismatch {
            field,
            header: header.to_string(),
            payload: payload.to_string(),
        })
    }
}
