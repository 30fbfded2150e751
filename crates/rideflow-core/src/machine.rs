//! Trip state machine.
//!
//! Holds the authoritative snapshot of one trip on one replica (passenger,
//! driver, or dispatcher) and decides which transitions are legal.
//!
//! ```text
//! Requested ─(system)─> Matched ─(system)─> DriverEnRoute ─(driver)─> DriverArrived
//!                                                                          │
//!                       Completed <─(driver)─ InProgress <─(driver)────────┘
//!
//! any non-terminal ─(passenger | driver | system w/ NoDriverFound)─> Cancelled
//! ```
//!
//! Two entry points: [`TripMachine::apply`] consumes sequenced events, and
//! [`TripMachine::request_transition`] validates a local intent and produces
//! the event to send. `request_transition` never mutates the trip; the
//! coordinator commits the event through `apply` once the channel accepts it.
//!
//! # Cancel wins
//!
//! Replicas emit concurrently, so a cancel can be stamped with a version that
//! another replica already used for a different transition. Such a cancel is
//! applied on top of the local trip at `max(event.version, version + 1)` (see
//! [`TripMachine::apply_racing_cancel`]). Every replica therefore ends in
//! `Cancelled` once it has seen the cancel, regardless of arrival order.
//!
//! Overturning a `Completed` trip only reaches peers that are still listening.
//! Once every other replica has closed its channel after the terminal linger,
//! a late cancel lands on the sender alone and the replicas disagree.

use rideflow_proto::{Actor, CancellationReason, Trip, TripEvent, TripState, UserId};

use crate::error::{RejectReason, RejectedTransition};

/// Non-cancel transitions: `(from, to, actor)`.
pub const TRANSITIONS: [(TripState, TripState, Actor); 5] = [
    (TripState::Requested, TripState::Matched, Actor::System),
    (TripState::Matched, TripState::DriverEnRoute, Actor::System),
    (TripState::DriverEnRoute, TripState::DriverArrived, Actor::Driver),
    (TripState::DriverArrived, TripState::InProgress, Actor::Driver),
    (TripState::InProgress, TripState::Completed, Actor::Driver),
];

/// Whether `actor` may move a trip from `from` to `to`.
///
/// Cancellation is allowed from any non-terminal state, but only with the
/// reason matching the actor: a passenger cancel is `PassengerCancelled`, a
/// driver cancel is `DriverCancelled`, and the system only cancels with
/// `NoDriverFound`.
pub fn is_allowed(
    from: TripState,
    to: TripState,
    actor: Actor,
    reason: Option<CancellationReason>,
) -> bool {
    if to == TripState::Cancelled {
        return !from.is_terminal() && reason == Some(CancellationReason::for_actor(actor));
    }
    TRANSITIONS.contains(&(from, to, actor))
}

/// Authoritative trip snapshot plus the replica's Lamport clock.
#[derive(Debug, Clone)]
pub struct TripMachine {
    trip: Trip,
    clock: u64,
}

impl TripMachine {
    /// Wrap an existing snapshot.
    pub fn new(trip: Trip) -> Self {
        Self { trip, clock: 0 }
    }

    /// Current snapshot.
    pub fn trip(&self) -> &Trip {
        &self.trip
    }

    /// Current Lamport time.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Advance the clock for a local send and return the new timestamp.
    pub fn tick_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Merge a remote timestamp (Lamport receive rule).
    pub fn observe(&mut self, remote: u64) {
        self.clock = self.clock.max(remote) + 1;
    }

    /// Apply a sequenced inbound (or locally committed) event.
    ///
    /// # Errors
    ///
    /// - `StaleVersion` if `event.version <= trip.version`
    /// - `VersionGap` if `event.version > trip.version + 1`
    /// - `InvalidTransition` if the event targets another trip, starts from a
    ///   state other than the current one, or is not allowed for its actor
    ///
    /// A second `Cancelled` event for an already-cancelled trip is a no-op
    /// success, whatever its version.
    pub fn apply(&mut self, event: &TripEvent) -> Result<Trip, RejectedTransition> {
        if event.trip_id != self.trip.id {
            return Err(self.reject(RejectReason::InvalidTransition, event));
        }

        self.observe(event.emitted_at);

        if event.to == TripState::Cancelled && self.trip.state == TripState::Cancelled {
            tracing::debug!(
                trip_id = %self.trip.id,
                version = event.version,
                actor = %event.actor,
                "Concurrent cancel is a no-op"
            );
            return Ok(self.trip.clone());
        }

        if event.version <= self.trip.version {
            return Err(self.reject(RejectReason::StaleVersion, event));
        }

        if event.version > self.trip.version + 1 {
            return Err(self.reject(RejectReason::VersionGap, event));
        }

        if event.from != self.trip.state || !self.event_is_legal(event) {
            return Err(self.reject(RejectReason::InvalidTransition, event));
        }

        self.commit(event, event.version);
        Ok(self.trip.clone())
    }

    /// Apply a `Cancelled` event that [`TripMachine::apply`] refused because
    /// this replica already moved on.
    ///
    /// The cancel was emitted concurrently with whatever this replica applied
    /// at that version, or from a state this replica already left. Either
    /// way cancellation wins: the trip moves to `Cancelled` at
    /// `max(event.version, version + 1)`. A `Completed` trip is overturned
    /// too, since a peer can only have emitted the cancel before it saw the
    /// completion. That overturn converges only while the other replicas are
    /// inside their terminal linger window.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the event is not a legal cancel
    pub fn apply_racing_cancel(&mut self, event: &TripEvent) -> Result<Trip, RejectedTransition> {
        if event.trip_id != self.trip.id
            || event.to != TripState::Cancelled
            || !is_allowed(event.from, event.to, event.actor, event.reason)
        {
            return Err(self.reject(RejectReason::InvalidTransition, event));
        }

        self.observe(event.emitted_at);

        if self.trip.state == TripState::Cancelled {
            return Ok(self.trip.clone());
        }

        let version = event.version.max(self.trip.version + 1);
        tracing::info!(
            trip_id = %self.trip.id,
            overridden = %self.trip.state,
            event_version = event.version,
            version,
            actor = %event.actor,
            "Racing cancel wins"
        );
        self.commit(event, version);
        Ok(self.trip.clone())
    }

    /// Validate a local intent and build the event to send.
    ///
    /// Cancels carry the reason matching `actor`. A `Matched` transition needs
    /// a driver; use [`TripMachine::request_match`].
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` if the transition is illegal from the current
    ///   state for `actor`
    pub fn request_transition(
        &mut self,
        to: TripState,
        actor: Actor,
    ) -> Result<TripEvent, RejectedTransition> {
        self.propose(to, actor, None)
    }

    /// Validate and build the dispatcher's `Matched` event for `driver`.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless the trip is `Requested`
    pub fn request_match(&mut self, driver: UserId) -> Result<TripEvent, RejectedTransition> {
        self.propose(TripState::Matched, Actor::System, Some(driver))
    }

    /// Adopt a resync snapshot if it is ahead of the local trip.
    ///
    /// A cancelled snapshot always wins over a non-cancelled local trip
    /// (landing at `version + 1` if it is not ahead). Returns whether the
    /// local trip changed.
    pub fn restore(&mut self, snapshot: &Trip) -> bool {
        if snapshot.id != self.trip.id || self.trip.state == TripState::Cancelled {
            return false;
        }

        if snapshot.state == TripState::Cancelled {
            let version = snapshot.version.max(self.trip.version + 1);
            self.trip = Trip { version, ..snapshot.clone() };
            return true;
        }

        if snapshot.version > self.trip.version && !self.trip.is_terminal() {
            self.trip = snapshot.clone();
            return true;
        }

        false
    }

    fn propose(
        &mut self,
        to: TripState,
        actor: Actor,
        driver: Option<UserId>,
    ) -> Result<TripEvent, RejectedTransition> {
        let reason = (to == TripState::Cancelled).then(|| CancellationReason::for_actor(actor));
        let event = TripEvent {
            trip_id: self.trip.id,
            from: self.trip.state,
            to,
            version: self.trip.version + 1,
            emitted_at: self.clock + 1,
            actor,
            driver,
            reason,
        };

        if !self.event_is_legal(&event) {
            return Err(self.reject(RejectReason::InvalidTransition, &event));
        }

        self.tick_clock();
        Ok(event)
    }

    fn event_is_legal(&self, event: &TripEvent) -> bool {
        if !is_allowed(event.from, event.to, event.actor, event.reason) {
            return false;
        }
        match event.to {
            TripState::Matched => event.driver.is_some(),
            TripState::Cancelled => true,
            _ => event.reason.is_none(),
        }
    }

    fn commit(&mut self, event: &TripEvent, version: u64) {
        debug_assert!(version > self.trip.version);

        self.trip.state = event.to;
        self.trip.version = version;
        if event.to == TripState::Matched {
            self.trip.driver = event.driver;
        }
        if event.to == TripState::Cancelled {
            self.trip.cancellation_reason = event.reason;
        }
    }

    fn reject(&self, reason: RejectReason, event: &TripEvent) -> RejectedTransition {
        RejectedTransition {
            reason,
            trip_id: self.trip.id,
            current: self.trip.state,
            version: self.trip.version,
            from: event.from,
            to: event.to,
            actor: event.actor,
            attempted: event.version,
        }
    }
}
