//! Trip data model.
//!
//! These types travel on the wire inside `trip-event` and `resync-response`
//! payloads. Transition rules live in `rideflow-core`; this module only
//! describes the shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{TripId, UserId};

/// Lifecycle state of a trip.
///
/// ```text
/// Requested ─> Matched ─> DriverEnRoute ─> DriverArrived ─> InProgress ─> Completed
///     │           │             │                │              │
///     └───────────┴─────────────┴────────────────┴──────────────┴──> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripState {
    /// Passenger asked for a ride, dispatcher is searching for a driver
    Requested,
    /// A driver accepted the request
    Matched,
    /// Driver is heading to the pickup point
    DriverEnRoute,
    /// Driver confirmed arrival at the pickup point
    DriverArrived,
    /// Passenger on board, ride underway
    InProgress,
    /// Ride finished (terminal)
    Completed,
    /// Ride cancelled before completion (terminal)
    Cancelled,
}

impl TripState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Requested,
        Self::Matched,
        Self::DriverEnRoute,
        Self::DriverArrived,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
    ];

    /// No transition leaves a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Matched => "matched",
            Self::DriverEnRoute => "driver-en-route",
            Self::DriverArrived => "driver-arrived",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TripState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who initiated a transition or sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    /// The rider
    Passenger,
    /// The driver
    Driver,
    /// The dispatch backend
    System,
}

impl Actor {
    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passenger => "passenger",
            Self::Driver => "driver",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trip ended in [`TripState::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancellationReason {
    /// Passenger pressed cancel
    PassengerCancelled,
    /// Driver pressed cancel
    DriverCancelled,
    /// Dispatcher gave up searching for a driver
    NoDriverFound,
}

impl CancellationReason {
    /// Default reason for an explicit cancel by `actor`.
    #[must_use]
    pub const fn for_actor(actor: Actor) -> Self {
        match actor {
            Actor::Passenger => Self::PassengerCancelled,
            Actor::Driver => Self::DriverCancelled,
            Actor::System => Self::NoDriverFound,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PassengerCancelled => "passenger cancelled",
            Self::DriverCancelled => "driver cancelled",
            Self::NoDriverFound => "no driver found",
        })
    }
}

/// Snapshot of one trip.
///
/// # Invariants
///
/// - `driver` is `None` while `state == Requested`
/// - `cancellation_reason` is `Some` iff `state == Cancelled`
/// - `version` only grows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    /// Trip identifier
    pub id: TripId,
    /// Current lifecycle state
    pub state: TripState,
    /// The rider
    pub passenger: UserId,
    /// Matched driver, absent until `Matched`
    pub driver: Option<UserId>,
    /// Number of accepted transitions so far
    pub version: u64,
    /// Present only when cancelled
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cancellation_reason: Option<CancellationReason>,
}

impl Trip {
    /// A freshly requested trip at version 0.
    #[must_use]
    pub fn requested(id: TripId, passenger: UserId) -> Self {
        Self {
            id,
            state: TripState::Requested,
            passenger,
            driver: None,
            version: 0,
            cancellation_reason: None,
        }
    }

    /// Whether the trip reached `Completed` or `Cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One state transition, as emitted by the side that initiated it.
///
/// Never mutated after creation. The receiver's sequencer consumes it exactly
/// once; retransmits are discarded by version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripEvent {
    /// Trip this event belongs to
    pub trip_id: TripId,
    /// State the emitter observed before the transition
    pub from: TripState,
    /// State after the transition
    pub to: TripState,
    /// Trip version after the transition
    pub version: u64,
    /// Lamport timestamp of the emitter
    pub emitted_at: u64,
    /// Who initiated the transition
    pub actor: Actor,
    /// Driver assigned by a `Matched` transition
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub driver: Option<UserId>,
    /// Reason carried by a `Cancelled` transition
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<CancellationReason>,
}
