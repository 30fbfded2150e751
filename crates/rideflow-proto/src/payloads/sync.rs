//! Stream control payloads: resync and acknowledgement.

use serde::{Deserialize, Serialize};

use crate::{Trip, UserId};

/// Identifies one sequenced stream inside a trip.
///
/// The trip-event stream is shared by all participants. Chat is sequenced per
/// sender, so each sender owns its own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Versioned trip events
    Trip,
    /// Chat messages posted by `sender`
    Chat {
        /// Owner of the chat stream
        sender: UserId,
    },
}

/// Ask the counterpart to re-emit state for a stream.
///
/// For [`StreamKind::Trip`] the answer is a [`ResyncResponse`] snapshot. For
/// [`StreamKind::Chat`] the stream owner re-sends its messages with a sequence
/// number greater than `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// Stream to resync
    pub stream: StreamKind,
    /// Highest item the requester has applied
    pub after: u64,
}

/// Fresh trip snapshot answering a trip resync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncResponse {
    /// Current trip as seen by the responder
    pub trip: Trip,
}

/// Cumulative acknowledgement: everything up to `up_to` on `stream` arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Stream being acknowledged
    pub stream: StreamKind,
    /// Highest contiguous version or sequence number received
    pub up_to: u64,
}
