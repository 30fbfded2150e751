//! Error types for the trip coordination core.
//!
//! Errors are split by who can act on them: [`RejectedTransition`] belongs to
//! the state machine, [`ChannelError`] to the connection, [`ChatError`] to
//! the chat log. [`CoordinatorError`] is the union returned to callers of the
//! coordinator. [`GapTimeout`] never reaches a user; it is turned into a
//! resync request.

use std::{fmt, time::Duration};

use rideflow_proto::{Actor, ProtocolError, TripId, TripState};
use thiserror::Error;

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Event version is not newer than the trip's version
    StaleVersion,
    /// Transition is not in the table, starts from the wrong state, or the
    /// actor may not perform it
    InvalidTransition,
    /// Event version skips past `version + 1`
    VersionGap,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StaleVersion => "stale version",
            Self::InvalidTransition => "invalid transition",
            Self::VersionGap => "version gap",
        })
    }
}

/// A transition the state machine refused to apply or emit.
///
/// The trip is unchanged whenever this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {actor} {from} -> {to} at v{attempted} (trip {trip_id} is {current} at v{version})")]
pub struct RejectedTransition {
    /// Why the transition was refused
    pub reason: RejectReason,
    /// Trip the transition targeted
    pub trip_id: TripId,
    /// Trip state when the transition was refused
    pub current: TripState,
    /// Trip version when the transition was refused
    pub version: u64,
    /// State the transition claimed to start from
    pub from: TripState,
    /// Requested target state
    pub to: TripState,
    /// Actor that initiated the transition
    pub actor: Actor,
    /// Version carried by the refused event
    pub attempted: u64,
}

impl RejectedTransition {
    /// Stale and gapped events are resolved by the sequencer and resync. An
    /// invalid transition will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self.reason, RejectReason::StaleVersion | RejectReason::VersionGap)
    }
}

/// Errors raised by the channel manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Send attempted while the trip's connection is not up
    #[error("trip {trip_id} is not connected")]
    NotConnected {
        /// Trip whose connection is down
        trip_id: TripId,
    },

    /// Frame could not be encoded
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// `NotConnected` clears once the link comes back. The caller decides
    /// whether to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Errors raised when composing a chat message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Body is empty or whitespace
    #[error("chat message body is empty")]
    EmptyBody,

    /// Body exceeds the maximum length
    #[error("chat message body too long: {len} bytes (max {max})")]
    BodyTooLong {
        /// Body length in bytes
        len: usize,
        /// Maximum allowed length
        max: usize,
    },
}

/// Errors returned by [`crate::TripCoordinator::handle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// State machine refused the transition
    #[error(transparent)]
    Rejected(#[from] RejectedTransition),

    /// Connection refused the send
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Chat message was refused
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// Inbound frame was malformed or addressed to another trip
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Coordinator was shut down
    #[error("trip {trip_id} coordinator is closed")]
    Closed {
        /// Trip whose coordinator is closed
        trip_id: TripId,
    },
}

impl CoordinatorError {
    /// Whether the same request may succeed later without user changes.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Rejected(e) => e.is_transient(),
            Self::Channel(e) => e.is_transient(),
            Self::Chat(_) | Self::Protocol(_) | Self::Closed { .. } => false,
        }
    }

    /// The refused transition, if that is what failed.
    pub fn rejection(&self) -> Option<&RejectedTransition> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for CoordinatorError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// A sequencer gap that outlived its wait window.
///
/// Handled internally by sending a resync request for the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gap timeout on stream {key}: stuck after {last_applied} for {waited:?}")]
pub struct GapTimeout<K: fmt::Display> {
    /// Stream key
    pub key: K,
    /// Highest contiguous item delivered
    pub last_applied: u64,
    /// How long the gap has been open
    pub waited: Duration,
}
