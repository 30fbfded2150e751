//! Runtime error types.

use rideflow_core::CoordinatorError;
use rideflow_proto::{TripId, UserId};
use thiserror::Error;

/// Failures opening or using a transport link.
///
/// Never fatal to a trip: the runtime reports them to the coordinator as a
/// dropped link, which schedules a reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint refused or could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// The participant has no network
    #[error("user {user} is offline")]
    Offline {
        /// Participant whose network is down
        user: UserId,
    },

    /// The link closed while in use
    #[error("link closed")]
    Closed,
}

impl TransportError {
    /// Every transport failure may clear on its own; the reconnect loop
    /// keeps trying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Offline { .. } | Self::Closed)
    }
}

/// Failures returned to callers of a [`crate::TripHandle`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// The coordinator refused the request
    #[error(transparent)]
    Refused(#[from] CoordinatorError),

    /// The trip's runtime task has exited
    #[error("trip {trip_id} runtime has stopped")]
    Stopped {
        /// Trip whose runtime stopped
        trip_id: TripId,
    },
}

impl SubmitError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Refused(e) => e.is_transient(),
            Self::Stopped { .. } => false,
        }
    }

    /// The coordinator's reason, if the request reached it.
    pub fn refusal(&self) -> Option<&CoordinatorError> {
        match self {
            Self::Refused(e) => Some(e),
            Self::Stopped { .. } => None,
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Profile name is not one of the presets
    #[error("unknown profile '{0}' (expected development, staging, or production)")]
    UnknownProfile(String),
}
