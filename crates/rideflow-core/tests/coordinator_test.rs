//! Multi-participant coordinator tests.
//!
//! Passenger, driver, and dispatcher coordinators are wired through an
//! in-memory mesh that delivers every sent frame to the other participants.
//! Tests hold, drop, or reorder frames to exercise the races a real network
//! produces.

use std::{collections::VecDeque, time::Duration};

use rideflow_core::{
    Alert, ChannelError, ChatError, ConnectionStatus, CoordinatorConfig, CoordinatorError, GatePhase,
    RejectReason, TripAction, TripCoordinator, TripInput, TripMachine,
};
use rideflow_proto::{
    Actor, CancellationReason, Frame, Payload, ResyncRequest, ResyncResponse, StreamKind, Trip, TripEvent,
    TripId, TripState, UserId,
};

const TRIP: TripId = TripId::new(0xA11CE);
const PASSENGER: UserId = UserId::new(7);
const DRIVER: UserId = UserId::new(9);

const P: usize = 0;
const R: usize = 1;
const D: usize = 2;

struct Mesh {
    nodes: Vec<TripCoordinator<Duration>>,
    logs: Vec<Vec<TripAction>>,
    inflight: VecDeque<(usize, Frame)>,
    drop_next: usize,
    now: Duration,
}

impl Mesh {
    /// Passenger, driver, and dispatcher, all connected, trip `Requested`.
    fn connected() -> Self {
        let trip = Trip::requested(TRIP, PASSENGER);
        let config = CoordinatorConfig::default();
        let now = Duration::ZERO;
        let nodes = vec![
            TripCoordinator::new(trip.clone(), PASSENGER, Actor::Passenger, config.clone(), now),
            TripCoordinator::new(trip.clone(), DRIVER, Actor::Driver, config.clone(), now),
            TripCoordinator::new(trip, UserId::SYSTEM, Actor::System, config, now),
        ];

        let mut mesh = Self { nodes, logs: vec![Vec::new(); 3], inflight: VecDeque::new(), drop_next: 0, now };
        for i in 0..3 {
            let actions = mesh.nodes[i].start();
            mesh.collect(i, actions);
            mesh.handle(i, TripInput::LinkUp).unwrap();
        }
        mesh.deliver_all();
        mesh
    }

    /// Connected mesh with the trip driven to `state` through the normal flow.
    fn at(state: TripState) -> Self {
        let mut mesh = Self::connected();
        let path = [
            (D, TripInput::AssignDriver { driver: DRIVER }),
            (D, TripInput::Submit { actor: Actor::System, desired: TripState::DriverEnRoute }),
            (R, TripInput::Submit { actor: Actor::Driver, desired: TripState::DriverArrived }),
            (R, TripInput::Submit { actor: Actor::Driver, desired: TripState::InProgress }),
            (R, TripInput::Submit { actor: Actor::Driver, desired: TripState::Completed }),
        ];
        for (node, input) in path {
            if mesh.nodes[P].trip().state == state {
                break;
            }
            mesh.handle(node, input).unwrap();
            mesh.deliver_all();
        }
        assert_eq!(mesh.nodes[P].trip().state, state);
        mesh.logs.iter_mut().for_each(Vec::clear);
        mesh
    }

    fn handle(&mut self, node: usize, input: TripInput) -> Result<(), CoordinatorError> {
        let actions = self.nodes[node].handle(input, self.now)?;
        self.collect(node, actions);
        Ok(())
    }

    fn collect(&mut self, node: usize, actions: Vec<TripAction>) {
        for action in actions {
            if let TripAction::SendFrame(frame) = &action {
                if self.drop_next > 0 {
                    self.drop_next -= 1;
                } else {
                    self.inflight.push_back((node, frame.clone()));
                }
            }
            self.logs[node].push(action);
        }
    }

    fn deliver_all(&mut self) {
        let mut budget = 10_000;
        while let Some((from, frame)) = self.inflight.pop_front() {
            budget -= 1;
            assert!(budget > 0, "mesh did not settle");
            for to in 0..self.nodes.len() {
                if to != from {
                    self.handle(to, TripInput::FrameReceived(frame.clone())).unwrap();
                }
            }
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        for node in 0..self.nodes.len() {
            self.handle(node, TripInput::Tick).unwrap();
        }
        self.deliver_all();
    }

    fn changes(&self, node: usize) -> Vec<Trip> {
        self.logs[node]
            .iter()
            .filter_map(|a| match a {
                TripAction::TripChanged(trip) => Some(trip.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(&self) -> Vec<TripState> {
        self.nodes.iter().map(|n| n.trip().state).collect()
    }
}

/// The dispatcher's and driver's events for a full ride, v1 through v5.
fn ride_events() -> Vec<TripEvent> {
    let mut machine = TripMachine::new(Trip::requested(TRIP, PASSENGER));
    let mut events = Vec::new();

    let matched = machine.request_match(DRIVER).unwrap();
    machine.apply(&matched).unwrap();
    events.push(matched);

    for (to, actor) in [
        (TripState::DriverEnRoute, Actor::System),
        (TripState::DriverArrived, Actor::Driver),
        (TripState::InProgress, Actor::Driver),
        (TripState::Completed, Actor::Driver),
    ] {
        let event = machine.request_transition(to, actor).unwrap();
        machine.apply(&event).unwrap();
        events.push(event);
    }
    events
}

fn event_frame(event: &TripEvent) -> Frame {
    let sender = if event.actor == Actor::Driver { DRIVER } else { UserId::SYSTEM };
    Payload::TripEvent(event.clone()).into_frame(TRIP, sender).unwrap()
}

/// A lone connected passenger fed frames by hand.
fn passenger() -> TripCoordinator<Duration> {
    let mut node = TripCoordinator::new(
        Trip::requested(TRIP, PASSENGER),
        PASSENGER,
        Actor::Passenger,
        CoordinatorConfig::default(),
        Duration::ZERO,
    );
    node.start();
    node.handle(TripInput::LinkUp, Duration::ZERO).unwrap();
    node
}

fn sent_payloads(actions: &[TripAction]) -> Vec<Payload> {
    actions
        .iter()
        .filter_map(|a| match a {
            TripAction::SendFrame(frame) => Some(Payload::from_frame(frame).unwrap()),
            _ => None,
        })
        .collect()
}

fn changed_versions(actions: &[TripAction]) -> Vec<u64> {
    actions
        .iter()
        .filter_map(|a| match a {
            TripAction::TripChanged(trip) => Some(trip.version),
            _ => None,
        })
        .collect()
}

#[test]
fn full_ride_notifies_passenger_five_times() {
    let mut mesh = Mesh::at(TripState::Requested);

    mesh.handle(D, TripInput::AssignDriver { driver: DRIVER }).unwrap();
    mesh.deliver_all();
    mesh.handle(D, TripInput::Submit { actor: Actor::System, desired: TripState::DriverEnRoute }).unwrap();
    mesh.deliver_all();

    for _ in 0..3 {
        mesh.handle(R, TripInput::GestureStart).unwrap();
        mesh.handle(R, TripInput::GestureMove { progress: 0.8 }).unwrap();
        mesh.handle(R, TripInput::GestureRelease).unwrap();
        mesh.deliver_all();
    }

    let seen: Vec<(TripState, u64)> = mesh.changes(P).iter().map(|t| (t.state, t.version)).collect();
    assert_eq!(
        seen,
        vec![
            (TripState::Matched, 1),
            (TripState::DriverEnRoute, 2),
            (TripState::DriverArrived, 3),
            (TripState::InProgress, 4),
            (TripState::Completed, 5),
        ]
    );

    let final_trip = mesh.nodes[P].trip().clone();
    assert_eq!(final_trip.driver, Some(DRIVER));
    for node in &mesh.nodes {
        assert_eq!(node.trip(), &final_trip);
    }
}

#[test]
fn finished_trip_lingers_then_closes() {
    let mut mesh = Mesh::at(TripState::Completed);

    mesh.advance(Duration::from_millis(100));
    for node in &mesh.nodes {
        assert_eq!(node.unacked_len(), 0);
        assert!(!node.is_closed());
    }

    mesh.advance(Duration::from_secs(5));
    for (i, node) in mesh.nodes.iter().enumerate() {
        assert!(node.is_closed());
        assert!(mesh.logs[i].contains(&TripAction::CloseLink));
    }
}

#[test]
fn finished_trip_closes_after_linger_without_acks() {
    let mut mesh = Mesh::at(TripState::InProgress);
    let mut driver = mesh.nodes.remove(R);
    let t0 = mesh.now;

    // Cut off from the mesh: the completion is never acked.
    driver.handle(TripInput::Submit { actor: Actor::Driver, desired: TripState::Completed }, t0).unwrap();
    assert_eq!(driver.unacked_len(), 1);

    driver.handle(TripInput::Tick, t0 + Duration::from_secs(4)).unwrap();
    assert!(!driver.is_closed());

    let actions = driver.handle(TripInput::Tick, t0 + Duration::from_secs(5)).unwrap();
    assert!(driver.is_closed());
    assert!(actions.contains(&TripAction::CloseLink));
}

#[test]
fn submit_while_disconnected_changes_nothing() {
    let mut node = TripCoordinator::new(
        Trip::requested(TRIP, PASSENGER),
        PASSENGER,
        Actor::Passenger,
        CoordinatorConfig::default(),
        Duration::ZERO,
    );
    node.start();

    let err = node
        .handle(TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled }, Duration::ZERO)
        .unwrap_err();

    assert_eq!(err, CoordinatorError::Channel(ChannelError::NotConnected { trip_id: TRIP }));
    assert!(err.is_transient());
    assert_eq!(node.trip(), &Trip::requested(TRIP, PASSENGER));
}

#[test]
fn illegal_submissions_are_rejected() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    let err = mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Completed });
    let err = err.unwrap_err();
    assert_eq!(err.rejection().unwrap().reason, RejectReason::InvalidTransition);
    assert!(!err.is_transient());

    // Acting in someone else's role
    let err = mesh.handle(P, TripInput::Submit { actor: Actor::Driver, desired: TripState::DriverArrived });
    assert!(err.unwrap_err().rejection().is_some());

    // Only the dispatcher matches drivers
    let err = mesh.handle(P, TripInput::AssignDriver { driver: DRIVER });
    assert!(err.unwrap_err().rejection().is_some());

    assert!(mesh.inflight.is_empty());
    assert_eq!(mesh.nodes[P].trip().version, 2);
}

#[test]
fn passenger_cancel_reaches_everyone() {
    let mut mesh = Mesh::at(TripState::Matched);

    mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled }).unwrap();
    mesh.deliver_all();

    for node in &mesh.nodes {
        let trip = node.trip();
        assert_eq!(trip.state, TripState::Cancelled);
        assert_eq!(trip.version, 2);
        assert_eq!(trip.cancellation_reason, Some(CancellationReason::PassengerCancelled));
    }
}

#[test]
fn concurrent_cancels_converge() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled }).unwrap();
    mesh.handle(R, TripInput::Submit { actor: Actor::Driver, desired: TripState::Cancelled }).unwrap();
    mesh.deliver_all();

    assert_eq!(mesh.states(), vec![TripState::Cancelled; 3]);

    // Each side keeps its own reason; the dispatcher took whichever arrived first.
    assert_eq!(mesh.nodes[P].trip().cancellation_reason, Some(CancellationReason::PassengerCancelled));
    assert_eq!(mesh.nodes[R].trip().cancellation_reason, Some(CancellationReason::DriverCancelled));
    assert_eq!(mesh.nodes[D].trip().cancellation_reason, Some(CancellationReason::PassengerCancelled));

    for node in 0..3 {
        assert_eq!(mesh.changes(node).len(), 1, "node {node} notified more than once");
    }
}

#[test]
fn cancel_overturns_concurrent_completion() {
    let mut mesh = Mesh::at(TripState::InProgress);

    mesh.handle(R, TripInput::Submit { actor: Actor::Driver, desired: TripState::Completed }).unwrap();
    mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled }).unwrap();
    mesh.deliver_all();

    assert_eq!(mesh.states(), vec![TripState::Cancelled; 3]);
    assert_eq!(mesh.nodes[P].trip().version, 5);
    assert_eq!(mesh.nodes[R].trip().version, 6);

    let driver_saw: Vec<TripState> = mesh.changes(R).iter().map(|t| t.state).collect();
    assert_eq!(driver_saw, vec![TripState::Completed, TripState::Cancelled]);

    let relayed = sent_payloads(&mesh.logs[R]).into_iter().any(|p| {
        matches!(p, Payload::TripEvent(e) if e.version == 6 && e.to == TripState::Cancelled && e.actor == Actor::Passenger)
    });
    assert!(relayed);
}

#[test]
fn racing_cancel_reaches_driver_joined_from_stale_snapshot() {
    let mut mesh = Mesh::connected();

    mesh.handle(D, TripInput::AssignDriver { driver: DRIVER }).unwrap();
    mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled }).unwrap();

    // A driver app that joins from the dispatcher's snapshot and only hears
    // from the dispatcher afterwards
    let snapshot = mesh.nodes[D].trip().clone();
    let mut late = TripCoordinator::new(snapshot, DRIVER, Actor::Driver, CoordinatorConfig::default(), mesh.now);
    late.start();
    late.handle(TripInput::LinkUp, mesh.now).unwrap();

    mesh.logs[D].clear();
    mesh.deliver_all();
    assert_eq!(mesh.nodes[D].trip().state, TripState::Cancelled);
    assert_eq!(mesh.nodes[D].trip().version, 2);

    for action in &mesh.logs[D] {
        if let TripAction::SendFrame(frame) = action {
            late.handle(TripInput::FrameReceived(frame.clone()), mesh.now).unwrap();
        }
    }
    assert_eq!(late.trip().state, TripState::Cancelled);
    assert_eq!(late.trip().version, 2);
    assert_eq!(late.trip().cancellation_reason, Some(CancellationReason::PassengerCancelled));
}

#[test]
fn lost_event_is_retransmitted() {
    let mut mesh = Mesh::at(TripState::Matched);

    mesh.drop_next = 1;
    mesh.handle(D, TripInput::Submit { actor: Actor::System, desired: TripState::DriverEnRoute }).unwrap();
    mesh.deliver_all();
    assert_eq!(mesh.states(), vec![TripState::Matched, TripState::Matched, TripState::DriverEnRoute]);
    assert_eq!(mesh.nodes[D].unacked_len(), 1);

    mesh.advance(Duration::from_secs(2));
    assert_eq!(mesh.nodes[P].trip().state, TripState::Matched);

    mesh.advance(Duration::from_secs(1));
    assert_eq!(mesh.states(), vec![TripState::DriverEnRoute; 3]);
    assert_eq!(mesh.nodes[D].unacked_len(), 0);
}

#[test]
fn outbox_is_resent_after_reconnect() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(R, TripInput::Submit { actor: Actor::Driver, desired: TripState::DriverArrived }).unwrap();
    mesh.inflight.clear();
    mesh.handle(R, TripInput::LinkDown { reason: "cell handover".into() }).unwrap();
    assert_eq!(mesh.nodes[R].status(), ConnectionStatus::Reconnecting);

    mesh.logs[R].clear();
    mesh.advance(Duration::from_secs(1));
    assert!(mesh.logs[R].contains(&TripAction::OpenLink { attempt: 1 }));

    mesh.handle(R, TripInput::LinkUp).unwrap();
    mesh.deliver_all();

    assert_eq!(mesh.nodes[R].status(), ConnectionStatus::Connected);
    assert_eq!(mesh.states(), vec![TripState::DriverArrived; 3]);
}

#[test]
fn out_of_order_events_apply_in_order() {
    let events = ride_events();
    let mut node = passenger();
    let now = Duration::from_secs(1);

    let first = node.handle(TripInput::FrameReceived(event_frame(&events[0])), now).unwrap();
    assert_eq!(changed_versions(&first), vec![1]);

    let early = node.handle(TripInput::FrameReceived(event_frame(&events[2])), now).unwrap();
    assert!(changed_versions(&early).is_empty());
    assert_eq!(node.trip().version, 1);

    let fill = node.handle(TripInput::FrameReceived(event_frame(&events[1])), now).unwrap();
    assert_eq!(changed_versions(&fill), vec![2, 3]);
    assert_eq!(node.trip().state, TripState::DriverArrived);

    let dup = node.handle(TripInput::FrameReceived(event_frame(&events[1])), now).unwrap();
    assert!(changed_versions(&dup).is_empty());
}

#[test]
fn every_sequenced_frame_is_acked() {
    let events = ride_events();
    let mut node = passenger();

    let actions = node.handle(TripInput::FrameReceived(event_frame(&events[0])), Duration::ZERO).unwrap();
    let acks: Vec<_> = sent_payloads(&actions)
        .into_iter()
        .filter_map(|p| match p {
            Payload::Ack(ack) => Some(ack),
            _ => None,
        })
        .collect();

    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].stream, StreamKind::Trip);
    assert_eq!(acks[0].up_to, 1);
}

#[test]
fn gap_timeout_requests_one_resync() {
    let events = ride_events();
    let mut node = passenger();

    node.handle(TripInput::FrameReceived(event_frame(&events[0])), Duration::ZERO).unwrap();
    node.handle(TripInput::FrameReceived(event_frame(&events[2])), Duration::ZERO).unwrap();

    let quiet = node.handle(TripInput::Tick, Duration::from_secs(9)).unwrap();
    assert!(sent_payloads(&quiet).is_empty());

    let timed_out = node.handle(TripInput::Tick, Duration::from_secs(10)).unwrap();
    assert_eq!(
        sent_payloads(&timed_out),
        vec![Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Trip, after: 1 })]
    );

    for secs in [11, 30, 300] {
        let later = node.handle(TripInput::Tick, Duration::from_secs(secs)).unwrap();
        assert!(sent_payloads(&later).is_empty());
    }
}

#[test]
fn resync_snapshot_restores_and_releases_buffer() {
    let events = ride_events();
    let mut node = passenger();

    node.handle(TripInput::FrameReceived(event_frame(&events[0])), Duration::ZERO).unwrap();
    node.handle(TripInput::FrameReceived(event_frame(&events[4])), Duration::ZERO).unwrap();

    let mut snapshot = Trip::requested(TRIP, PASSENGER);
    snapshot.state = TripState::InProgress;
    snapshot.driver = Some(DRIVER);
    snapshot.version = 4;
    let frame = Payload::ResyncResponse(ResyncResponse { trip: snapshot }).into_frame(TRIP, UserId::SYSTEM).unwrap();

    let actions = node.handle(TripInput::FrameReceived(frame), Duration::from_secs(1)).unwrap();
    assert_eq!(changed_versions(&actions), vec![4, 5]);
    assert_eq!(node.trip().state, TripState::Completed);
}

#[test]
fn resync_request_is_answered_with_snapshot() {
    let mesh = Mesh::at(TripState::DriverArrived);
    let mut dispatcher = mesh.nodes.into_iter().nth(D).unwrap();

    let request = Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Trip, after: 1 })
        .into_frame(TRIP, PASSENGER)
        .unwrap();
    let actions = dispatcher.handle(TripInput::FrameReceived(request), Duration::from_secs(1)).unwrap();

    assert_eq!(
        sent_payloads(&actions),
        vec![Payload::ResyncResponse(ResyncResponse { trip: dispatcher.trip().clone() })]
    );
}

#[test]
fn events_from_outside_the_actors_role_are_dropped() {
    let events = ride_events();
    let mut node = passenger();
    let sent_as = |event: &TripEvent, sender| Payload::TripEvent(event.clone()).into_frame(TRIP, sender).unwrap();

    // Only the dispatcher matches.
    let forged = node.handle(TripInput::FrameReceived(sent_as(&events[0], DRIVER)), Duration::ZERO).unwrap();
    assert!(forged.is_empty());
    assert_eq!(node.trip().version, 0);

    node.handle(TripInput::FrameReceived(event_frame(&events[0])), Duration::ZERO).unwrap();
    node.handle(TripInput::FrameReceived(event_frame(&events[1])), Duration::ZERO).unwrap();
    assert_eq!(node.trip().version, 2);

    // Only the matched driver confirms arrival.
    let stranger = UserId::new(404);
    node.handle(TripInput::FrameReceived(sent_as(&events[2], stranger)), Duration::ZERO).unwrap();
    node.handle(TripInput::FrameReceived(sent_as(&events[2], UserId::SYSTEM)), Duration::ZERO).unwrap();
    assert_eq!(node.trip().state, TripState::DriverEnRoute);

    // A driver's cancel relayed by the dispatcher still lands.
    let cancel = TripMachine::new(node.trip().clone())
        .request_transition(TripState::Cancelled, Actor::Driver)
        .unwrap();
    node.handle(TripInput::FrameReceived(sent_as(&cancel, UserId::SYSTEM)), Duration::ZERO).unwrap();
    assert_eq!(node.trip().state, TripState::Cancelled);
    assert_eq!(node.trip().cancellation_reason, Some(CancellationReason::DriverCancelled));
}

#[test]
fn frames_for_other_trips_are_refused() {
    let events = ride_events();
    let mut node = passenger();

    let mut frame = event_frame(&events[0]);
    frame.header.set_trip_id(TripId::new(1));

    let err = node.handle(TripInput::FrameReceived(frame), Duration::ZERO).unwrap_err();
    assert!(matches!(err, CoordinatorError::Protocol(_)));
    assert_eq!(node.trip().version, 0);
}

#[test]
fn gesture_below_threshold_does_nothing() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(R, TripInput::GestureStart).unwrap();
    mesh.handle(R, TripInput::GestureMove { progress: 0.3 }).unwrap();
    mesh.handle(R, TripInput::GestureRelease).unwrap();

    assert!(mesh.inflight.is_empty());
    assert_eq!(mesh.nodes[R].gate_phase(), GatePhase::Armed);
    assert_eq!(mesh.nodes[R].trip().state, TripState::DriverEnRoute);
}

#[test]
fn gesture_sends_exactly_one_transition() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(R, TripInput::GestureStart).unwrap();
    mesh.handle(R, TripInput::GestureMove { progress: 0.9 }).unwrap();
    mesh.handle(R, TripInput::GestureMove { progress: 0.1 }).unwrap();
    mesh.handle(R, TripInput::GestureRelease).unwrap();
    mesh.handle(R, TripInput::GestureRelease).unwrap();
    mesh.handle(R, TripInput::GestureMove { progress: 1.0 }).unwrap();
    mesh.handle(R, TripInput::GestureRelease).unwrap();

    let events: Vec<TripEvent> = mesh
        .inflight
        .iter()
        .filter_map(|(_, frame)| match Payload::from_frame(frame).unwrap() {
            Payload::TripEvent(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].to, TripState::DriverArrived);
    assert_eq!(mesh.nodes[R].gate_phase(), GatePhase::Confirmed { target: TripState::DriverArrived });
}

#[test]
fn passenger_gestures_are_ignored() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(P, TripInput::GestureStart).unwrap();
    mesh.handle(P, TripInput::GestureMove { progress: 1.0 }).unwrap();
    mesh.handle(P, TripInput::GestureRelease).unwrap();

    assert!(mesh.inflight.is_empty());
    assert_eq!(mesh.nodes[P].gate_phase(), GatePhase::Armed);
}

#[test]
fn failed_gesture_alerts_and_rearms() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);
    mesh.handle(R, TripInput::LinkDown { reason: "offline".into() }).unwrap();

    mesh.handle(R, TripInput::GestureStart).unwrap();
    mesh.handle(R, TripInput::GestureMove { progress: 1.0 }).unwrap();
    mesh.handle(R, TripInput::GestureRelease).unwrap();

    let alert = mesh.logs[R].iter().find_map(|a| match a {
        TripAction::Alert(Alert::GestureFailed(e)) => Some(e.clone()),
        _ => None,
    });
    assert_eq!(alert, Some(CoordinatorError::Channel(ChannelError::NotConnected { trip_id: TRIP })));
    assert_eq!(mesh.nodes[R].gate_phase(), GatePhase::Armed);
    assert_eq!(mesh.nodes[R].trip().state, TripState::DriverEnRoute);
}

#[test]
fn chat_reaches_counterpart() {
    let mut mesh = Mesh::at(TripState::DriverEnRoute);

    mesh.handle(P, TripInput::PostChat { body: "I'm by the blue door".into() }).unwrap();
    mesh.deliver_all();
    mesh.handle(R, TripInput::PostChat { body: "two minutes".into() }).unwrap();
    mesh.deliver_all();

    let bodies = |node: usize| -> Vec<String> { mesh.nodes[node].chat_log().iter().map(|m| m.body.clone()).collect() };
    assert_eq!(bodies(P), vec!["I'm by the blue door", "two minutes"]);
    assert_eq!(bodies(R), vec!["I'm by the blue door", "two minutes"]);
    assert_eq!(mesh.nodes[R].chat_log()[0].sender_role, Actor::Passenger);
}

#[test]
fn invalid_chat_is_refused() {
    let mut mesh = Mesh::at(TripState::Matched);

    let err = mesh.handle(P, TripInput::PostChat { body: "   ".into() }).unwrap_err();
    assert_eq!(err, CoordinatorError::Chat(ChatError::EmptyBody));

    let err = mesh.handle(P, TripInput::PostChat { body: "x".repeat(5000) }).unwrap_err();
    assert!(matches!(err, CoordinatorError::Chat(ChatError::BodyTooLong { len: 5000, .. })));

    mesh.handle(P, TripInput::LinkDown { reason: "offline".into() }).unwrap();
    let err = mesh.handle(P, TripInput::PostChat { body: "hello".into() }).unwrap_err();
    assert!(err.is_transient());
    assert!(mesh.nodes[P].chat_log().is_empty());
}

#[test]
fn no_driver_found_alerts_passenger() {
    let mut mesh = Mesh::connected();

    mesh.handle(D, TripInput::Submit { actor: Actor::System, desired: TripState::Cancelled }).unwrap();
    mesh.deliver_all();

    assert!(mesh.logs[P].contains(&TripAction::Alert(Alert::NoDriverFound)));
    assert_eq!(mesh.nodes[P].trip().cancellation_reason, Some(CancellationReason::NoDriverFound));
}

#[test]
fn shutdown_refuses_further_intents() {
    let mut mesh = Mesh::at(TripState::Matched);

    mesh.handle(P, TripInput::Shutdown).unwrap();
    assert!(mesh.nodes[P].is_closed());
    assert_eq!(mesh.nodes[P].status(), ConnectionStatus::Disconnected);

    let err = mesh.handle(P, TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled });
    assert_eq!(err.unwrap_err(), CoordinatorError::Closed { trip_id: TRIP });

    // Network input is ignored, not an error.
    mesh.handle(D, TripInput::Submit { actor: Actor::System, desired: TripState::DriverEnRoute }).unwrap();
    mesh.deliver_all();
    assert_eq!(mesh.nodes[P].trip().state, TripState::Matched);
}
