//! Fuzz target for TripCoordinator
//!
//! Feeds a passenger coordinator an arbitrary mix of well-formed frames,
//! link changes, ticks, and user intents.
//!
//! # Invariants
//!
//! - Never panics, whatever arrives in whatever order
//! - Trip versions only move forward
//! - A terminal trip never becomes non-terminal
//! - Every `TripChanged` carries a higher version than the one before

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rideflow_core::{CoordinatorConfig, TripAction, TripCoordinator, TripInput};
use rideflow_proto::{
    Actor, CancellationReason, ChatMessage, Payload, ResyncRequest, StreamKind, Trip, TripEvent, TripId,
    TripState, UserId,
};

const TRIP: TripId = TripId::new(42);
const PASSENGER: UserId = UserId::new(1);
const DRIVER: UserId = UserId::new(2);

#[derive(Debug, Clone, Copy, Arbitrary)]
enum State {
    Requested,
    Matched,
    DriverEnRoute,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
}

impl From<State> for TripState {
    fn from(state: State) -> Self {
        match state {
            State::Requested => TripState::Requested,
            State::Matched => TripState::Matched,
            State::DriverEnRoute => TripState::DriverEnRoute,
            State::DriverArrived => TripState::DriverArrived,
            State::InProgress => TripState::InProgress,
            State::Completed => TripState::Completed,
            State::Cancelled => TripState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Event { from: State, to: State, version: u8, driver_actor: bool },
    Chat { sequence: u8, body: String },
    Resync { after: u8 },
    Snapshot { state: State, version: u8 },
    LinkUp,
    LinkDown,
    Tick { millis: u16 },
    Cancel,
    PostChat { body: String },
}

fn frame_for(op: &Op) -> Option<rideflow_proto::Frame> {
    let (payload, sender) = match op {
        Op::Event { from, to, version, driver_actor } => {
            let (actor, sender) = if *driver_actor { (Actor::Driver, DRIVER) } else { (Actor::System, UserId::SYSTEM) };
            let to = TripState::from(*to);
            let reason = (to == TripState::Cancelled).then(|| CancellationReason::for_actor(actor));
            let event = TripEvent {
                trip_id: TRIP,
                from: (*from).into(),
                to,
                version: u64::from(*version),
                emitted_at: u64::from(*version),
                actor,
                driver: Some(DRIVER),
                reason,
            };
            (Payload::TripEvent(event), sender)
        },
        Op::Chat { sequence, body } => {
            let message = ChatMessage {
                trip_id: TRIP,
                sequence_number: u64::from(*sequence),
                sender: DRIVER,
                sender_role: Actor::Driver,
                body: body.clone(),
                sent_at: 0,
            };
            (Payload::ChatMessage(message), DRIVER)
        },
        Op::Resync { after } => {
            let request = ResyncRequest { stream: StreamKind::Trip, after: u64::from(*after) };
            (Payload::ResyncRequest(request), DRIVER)
        },
        Op::Snapshot { state, version } => {
            let state = TripState::from(*state);
            let trip = Trip {
                state,
                version: u64::from(*version),
                driver: Some(DRIVER),
                cancellation_reason: (state == TripState::Cancelled).then_some(CancellationReason::DriverCancelled),
                ..Trip::requested(TRIP, PASSENGER)
            };
            (Payload::ResyncResponse(rideflow_proto::ResyncResponse { trip }), DRIVER)
        },
        _ => return None,
    };
    payload.into_frame(TRIP, sender).ok()
}

fuzz_target!(|ops: Vec<Op>| {
    let mut now = Duration::ZERO;
    let mut node = TripCoordinator::new(
        Trip::requested(TRIP, PASSENGER),
        PASSENGER,
        Actor::Passenger,
        CoordinatorConfig::default(),
        now,
    );
    node.start();

    let mut last_version = 0;
    let mut terminal = false;

    for op in ops {
        let input = match &op {
            Op::LinkUp => TripInput::LinkUp,
            Op::LinkDown => TripInput::LinkDown { reason: "fuzz".into() },
            Op::Tick { millis } => {
                now += Duration::from_millis(u64::from(*millis));
                TripInput::Tick
            },
            Op::Cancel => TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled },
            Op::PostChat { body } => TripInput::PostChat { body: body.clone() },
            _ => match frame_for(&op) {
                Some(frame) => TripInput::FrameReceived(frame),
                None => continue,
            },
        };

        let Ok(actions) = node.handle(input, now) else {
            continue;
        };

        for action in actions {
            if let TripAction::TripChanged(trip) = action {
                assert!(trip.version > last_version, "version went {last_version} -> {}", trip.version);
                last_version = trip.version;
            }
        }

        let trip = node.trip();
        assert!(trip.version >= last_version);
        if terminal {
            assert!(trip.is_terminal(), "left terminal state for {}", trip.state);
        }
        terminal = trip.is_terminal();
    }
});
