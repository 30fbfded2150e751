//! Frame kind discriminator.

use std::fmt;

/// Discriminates what a frame's payload contains.
///
/// Stored as a single byte in the header. Each kind maps to exactly one
/// [`crate::Payload`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// A versioned trip state transition
    TripEvent = 0x01,
    /// A chat message
    ChatMessage = 0x02,
    /// Ask the counterpart to re-emit state for a stream
    ResyncRequest = 0x03,
    /// Fresh trip snapshot answering a resync request
    ResyncResponse = 0x04,
    /// Cumulative acknowledgement of a sequenced stream
    Ack = 0x05,
}

impl FrameKind {
    /// Raw byte value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a raw byte. `None` if unrecognized.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Self::TripEvent),
            0x02 => Some(Self::ChatMessage),
            0x03 => Some(Self::ResyncRequest),
            0x04 => Some(Self::ResyncResponse),
            0x05 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Wire name, as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripEvent => "trip-event",
            Self::ChatMessage => "chat-message",
            Self::ResyncRequest => "resync-request",
            Self::ResyncResponse => "resync-response",
            Self::Ack => "ack",
        }
    }

    /// Whether frames of this kind are retransmitted until acknowledged.
    #[must_use]
    pub const fn is_sequenced(self) -> bool {
        matches!(self, Self::TripEvent | Self::ChatMessage)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
