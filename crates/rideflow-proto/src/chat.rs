//! Chat message model.

use serde::{Deserialize, Serialize};

use crate::{Actor, TripId, UserId};

/// Maximum chat body length in bytes.
pub const MAX_CHAT_BODY: usize = 4096;

/// One chat message in a trip's append-only log.
///
/// `sequence_number` is assigned by the sender and counts that sender's
/// messages in this trip, starting at 1. A gap means a message is in flight or
/// lost, never that messages were reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Trip the conversation belongs to
    pub trip_id: TripId,
    /// Per-sender sequence number (1-based)
    pub sequence_number: u64,
    /// Sender account
    pub sender: UserId,
    /// Sender role in the trip
    pub sender_role: Actor,
    /// Message text
    pub body: String,
    /// Sender's Lamport timestamp at send time
    pub sent_at: u64,
}
