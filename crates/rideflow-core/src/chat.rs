//! Per-trip chat log.
//!
//! Chat is an independent append-only stream multiplexed over the trip's
//! connection. Each sender numbers its own messages from 1, so ordering is
//! enforced per sender with the same gap policy as trip events. A chat gap
//! never blocks trip events and vice versa.

use std::{ops::Sub, time::Duration};

use rideflow_proto::{Actor, ChatMessage, TripId, UserId, chat::MAX_CHAT_BODY};

use crate::{
    error::{ChatError, GapTimeout},
    sequencer::{Ingest, Sequencer, SequencerConfig},
};

/// Outcome of receiving a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReceive {
    /// Messages appended to the log, in order
    Appended(Vec<ChatMessage>),
    /// Message is waiting behind a gap
    Buffered,
    /// Message was already seen (or is our own echo)
    Duplicate,
    /// Gap buffer overflowed; resync the sender's stream now
    Overflow,
}

/// Chat state for one trip on one replica.
#[derive(Debug, Clone)]
pub struct ChatSession<I> {
    trip_id: TripId,
    local: UserId,
    role: Actor,
    next_sequence: u64,
    log: Vec<ChatMessage>,
    sequencer: Sequencer<UserId, ChatMessage, I>,
}

impl<I> ChatSession<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty session for `local` posting as `role`.
    pub fn new(trip_id: TripId, local: UserId, role: Actor, config: SequencerConfig) -> Self {
        Self {
            trip_id,
            local,
            role,
            next_sequence: 1,
            log: Vec::new(),
            sequencer: Sequencer::new(config),
        }
    }

    /// Full log in append order.
    pub fn log(&self) -> &[ChatMessage] {
        &self.log
    }

    /// Highest contiguous sequence number seen from `sender`.
    pub fn last_seen(&self, sender: UserId) -> u64 {
        if sender == self.local { self.next_sequence - 1 } else { self.sequencer.last(sender) }
    }

    /// Compose, number, and append a local message.
    ///
    /// # Errors
    ///
    /// - `ChatError::EmptyBody` if the body is blank
    /// - `ChatError::BodyTooLong` if the body exceeds [`MAX_CHAT_BODY`] bytes
    pub fn post(&mut self, body: &str, sent_at: u64) -> Result<ChatMessage, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::EmptyBody);
        }
        if body.len() > MAX_CHAT_BODY {
            return Err(ChatError::BodyTooLong { len: body.len(), max: MAX_CHAT_BODY });
        }

        let message = ChatMessage {
            trip_id: self.trip_id,
            sequence_number: self.next_sequence,
            sender: self.local,
            sender_role: self.role,
            body: body.to_string(),
            sent_at,
        };
        self.next_sequence += 1;
        self.log.push(message.clone());

        Ok(message)
    }

    /// Receive a counterpart's message.
    pub fn on_receive(&mut self, message: ChatMessage, now: I) -> ChatReceive {
        if message.sender == self.local || message.trip_id != self.trip_id {
            return ChatReceive::Duplicate;
        }

        match self.sequencer.ingest(message.sender, message, now) {
            Ingest::Deliver(batch) => {
                self.log.extend(batch.iter().cloned());
                ChatReceive::Appended(batch)
            },
            Ingest::Buffered => ChatReceive::Buffered,
            Ingest::Duplicate(_) => ChatReceive::Duplicate,
            Ingest::Overflow => ChatReceive::Overflow,
        }
    }

    /// Senders whose gap outlived the wait window.
    pub fn tick(&mut self, now: I) -> Vec<GapTimeout<UserId>> {
        self.sequencer.tick(now)
    }

    /// Our own messages numbered after `after`, for answering a chat resync.
    pub fn own_messages_after(&self, after: u64) -> impl Iterator<Item = &ChatMessage> {
        self.log.iter().filter(move |m| m.sender == self.local && m.sequence_number > after)
    }
}
