//! Per-trip coordinator.
//!
//! Composes the state machine, sequencer, gate, chat session, and channel
//! manager for one trip as seen by one participant. Like the components it
//! wraps, the coordinator performs no I/O: the caller feeds [`TripInput`]s
//! with the current time and executes the returned [`TripAction`]s.
//!
//! # Flow
//!
//! ```text
//! local intent ─> gate ─> machine.request_transition ─> channel.send ─> machine.apply
//! inbound frame ─> sequencer ─> machine.apply ─> TripChanged
//! ```
//!
//! A local transition is committed only after the channel accepted its frame.
//! If the link is down the intent fails with `NotConnected` and nothing
//! changes.

use std::{ops::Sub, time::Duration};

use rideflow_proto::{
    Ack, Actor, CancellationReason, ChatMessage, Frame, Payload, ResyncRequest, ResyncResponse,
    StreamKind, Trip, TripEvent, TripId, TripState, UserId,
};

use crate::{
    channel::{ChannelAction, ChannelConfig, ChannelManager, ConnectionStatus},
    chat::{ChatReceive, ChatSession},
    env::elapsed_at_least,
    error::{CoordinatorError, RejectReason, RejectedTransition},
    gate::{ConfirmationGate, GateConfig, GatePhase},
    machine::TripMachine,
    sequencer::{Ingest, Sequencer, SequencerConfig},
};

/// Default time a finished trip keeps its channel open.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Connection and backoff settings
    pub channel: ChannelConfig,
    /// Gap handling for trip events and chat
    pub sequencer: SequencerConfig,
    /// Gesture threshold
    pub gate: GateConfig,
    /// How long a terminal trip keeps its channel open for peers to catch up
    /// and for racing cancels to land
    pub linger: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            sequencer: SequencerConfig::default(),
            gate: GateConfig::default(),
            linger: DEFAULT_LINGER,
        }
    }
}

/// Inputs the caller feeds into the coordinator.
#[derive(Debug, Clone)]
pub enum TripInput {
    /// Frame received on the trip's link
    FrameReceived(Frame),
    /// Transport link is up
    LinkUp,
    /// Transport link failed or dropped
    LinkDown {
        /// Transport's description of the failure
        reason: String,
    },
    /// Time passed; run timeouts and retries
    Tick,
    /// User asked for a transition
    Submit {
        /// Role the user acts as
        actor: Actor,
        /// Target state
        desired: TripState,
    },
    /// Dispatcher matched a driver (system role only)
    AssignDriver {
        /// Driver who accepted the trip
        driver: UserId,
    },
    /// Confirmation gesture began
    GestureStart,
    /// Confirmation gesture moved
    GestureMove {
        /// Fraction of the track covered, 0.0 to 1.0
        progress: f32,
    },
    /// Confirmation gesture ended
    GestureRelease,
    /// User posted a chat message
    PostChat {
        /// Message text
        body: String,
    },
    /// Tear down the trip's connection now
    Shutdown,
}

/// User-facing notices that are not tied to a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// The dispatcher gave up searching for a driver
    NoDriverFound,
    /// A confirmed gesture could not be submitted; the gate re-armed
    GestureFailed(CoordinatorError),
}

/// Actions the coordinator produces for the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum TripAction {
    /// Open the trip's transport link
    OpenLink {
        /// Attempt number, 0 for the initial connect
        attempt: u32,
    },
    /// Close the trip's transport link
    CloseLink,
    /// Write this frame to the link
    SendFrame(Frame),
    /// An accepted transition changed the trip
    TripChanged(Trip),
    /// A chat message was appended to the log
    ChatAppended(ChatMessage),
    /// Connection status changed
    StatusChanged(ConnectionStatus),
    /// Something the user should see
    Alert(Alert),
}

/// Coordinator for one trip on one participant.
#[derive(Debug)]
pub struct TripCoordinator<I> {
    trip_id: TripId,
    local: UserId,
    role: Actor,
    machine: TripMachine,
    events: Sequencer<TripId, TripEvent, I>,
    chat: ChatSession<I>,
    gate: ConfirmationGate,
    channel: ChannelManager<I>,
    linger: Duration,
    finished_at: Option<I>,
    closed: bool,
}

impl<I> TripCoordinator<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a coordinator for `trip` acting as `local` in `role`.
    ///
    /// The trip may be a fresh request (version 0) or a snapshot handed over
    /// when joining later, e.g. a driver joining at `Matched`.
    pub fn new(trip: Trip, local: UserId, role: Actor, config: CoordinatorConfig, now: I) -> Self {
        let trip_id = trip.id;
        let mut events = Sequencer::new(config.sequencer.clone());
        events.reset_to(trip_id, trip.version, now);

        Self {
            trip_id,
            local,
            role,
            machine: TripMachine::new(trip),
            events,
            chat: ChatSession::new(trip_id, local, role, config.sequencer),
            gate: ConfirmationGate::new(config.gate),
            channel: ChannelManager::new(config.channel),
            linger: config.linger,
            finished_at: None,
            closed: false,
        }
    }

    /// Trip identifier.
    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    /// Role this participant plays.
    pub fn role(&self) -> Actor {
        self.role
    }

    /// Current trip snapshot.
    pub fn trip(&self) -> &Trip {
        self.machine.trip()
    }

    /// Chat log in append order.
    pub fn chat_log(&self) -> &[ChatMessage] {
        self.chat.log()
    }

    /// Connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.channel.status(self.trip_id)
    }

    /// Gesture gate phase.
    pub fn gate_phase(&self) -> GatePhase {
        self.gate.phase()
    }

    /// Sequenced frames not yet acknowledged by every peer.
    pub fn unacked_len(&self) -> usize {
        self.channel.unacked_len(self.trip_id)
    }

    /// Whether the channel was torn down. A closed coordinator ignores
    /// network input and refuses user intents.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Open the trip's connection.
    pub fn start(&mut self) -> Vec<TripAction> {
        let mut actions = Self::map_channel(self.channel.connect(self.trip_id));
        self.update_peers();
        if self.trip().is_terminal() {
            actions.extend(self.close());
        }
        actions
    }

    /// Process one input.
    ///
    /// # Errors
    ///
    /// User intents (`Submit`, `AssignDriver`, `PostChat`) fail with the
    /// reason the request was refused. Network input fails only on frames
    /// that do not decode or belong to another trip; the coordinator state is
    /// unchanged in that case.
    pub fn handle(&mut self, input: TripInput, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        if self.closed {
            return match input {
                TripInput::Submit { .. } | TripInput::AssignDriver { .. } | TripInput::PostChat { .. } => {
                    Err(CoordinatorError::Closed { trip_id: self.trip_id })
                },
                _ => Ok(Vec::new()),
            };
        }

        match input {
            TripInput::FrameReceived(frame) => self.handle_frame(&frame, now),
            TripInput::LinkUp => Ok(self.link_up(now)),
            TripInput::LinkDown { reason } => Ok(self.link_down(&reason, now)),
            TripInput::Tick => Ok(self.tick(now)),
            TripInput::Submit { actor, desired } => self.submit(actor, desired, now),
            TripInput::AssignDriver { driver } => self.assign_driver(driver, now),
            TripInput::GestureStart => {
                if self.role == Actor::Driver {
                    self.gate.start(self.trip().state);
                }
                Ok(Vec::new())
            },
            TripInput::GestureMove { progress } => {
                self.gate.update(progress);
                Ok(Vec::new())
            },
            TripInput::GestureRelease => Ok(self.gesture_release(now)),
            TripInput::PostChat { body } => self.post_chat(&body, now),
            TripInput::Shutdown => Ok(self.close()),
        }
    }

    fn link_up(&mut self, now: I) -> Vec<TripAction> {
        let mut actions = Self::map_channel(self.channel.link_up(self.trip_id, now));

        // Catch up on anything missed while the link was down.
        let after = self.trip().version;
        actions.extend(self.send_control(Payload::ResyncRequest(ResyncRequest {
            stream: StreamKind::Trip,
            after,
        }), now));
        actions
    }

    fn link_down(&mut self, reason: &str, now: I) -> Vec<TripAction> {
        if self.trip().is_terminal() {
            return self.close();
        }
        Self::map_channel(self.channel.link_down(self.trip_id, reason, now))
    }

    fn tick(&mut self, now: I) -> Vec<TripAction> {
        let mut actions = Self::map_channel(self.channel.tick(now));

        for gap in self.events.tick(now) {
            tracing::info!(trip_id = %self.trip_id, error = %gap, "Requesting trip resync");
            actions.extend(self.send_control(
                Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Trip, after: gap.last_applied }),
                now,
            ));
        }

        for gap in self.chat.tick(now) {
            tracing::info!(trip_id = %self.trip_id, error = %gap, "Requesting chat resync");
            let stream = StreamKind::Chat { sender: gap.key };
            actions.extend(self.send_control(
                Payload::ResyncRequest(ResyncRequest { stream, after: gap.last_applied }),
                now,
            ));
        }

        // Stay reachable for the whole window: a cancel that raced the
        // final transition may still be in flight even once our outbox is
        // empty.
        if let Some(finished) = self.finished_at
            && elapsed_at_least(now, finished, self.linger)
        {
            let unacked = self.channel.unacked_len(self.trip_id);
            tracing::debug!(trip_id = %self.trip_id, unacked, "Linger over");
            actions.extend(self.close());
        }

        actions
    }

    fn handle_frame(&mut self, frame: &Frame, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        if frame.header.trip_id() != self.trip_id {
            return Err(CoordinatorError::Protocol(format!(
                "frame for trip {} delivered to trip {}",
                frame.header.trip_id(),
                self.trip_id
            )));
        }

        let from = frame.header.sender_id();
        if from == self.local {
            return Ok(Vec::new());
        }

        let payload = Payload::from_frame(frame).inspect_err(|e| {
            tracing::warn!(trip_id = %self.trip_id, sender = %from, error = %e, "Dropping malformed frame");
        })?;

        let actions = match payload {
            Payload::TripEvent(event) => self.on_trip_event(from, event, now),
            Payload::ChatMessage(message) => self.on_chat_message(message, now),
            Payload::ResyncRequest(request) => self.on_resync_request(from, &request, now),
            Payload::ResyncResponse(response) => self.on_resync_response(&response.trip, now),
            Payload::Ack(ack) => {
                self.channel.ack(self.trip_id, from, &ack);
                Vec::new()
            },
        };

        Ok(actions)
    }

    fn on_trip_event(&mut self, from: UserId, event: TripEvent, now: I) -> Vec<TripAction> {
        if !self.sender_may_emit(from, &event) {
            tracing::warn!(
                trip_id = %self.trip_id,
                sender = %from,
                actor = %event.actor,
                to = %event.to,
                "Dropping event from sender outside the actor's role"
            );
            return Vec::new();
        }

        let mut actions = Vec::new();

        match self.events.ingest(self.trip_id, event, now) {
            Ingest::Deliver(batch) => {
                for event in &batch {
                    self.apply_event(event, now, &mut actions);
                }
            },
            Ingest::Buffered => {},
            Ingest::Duplicate(event) => {
                if event.to == TripState::Cancelled && self.trip().state != TripState::Cancelled {
                    self.apply_racing_cancel(&event, now, &mut actions);
                }
            },
            Ingest::Overflow => {
                let after = self.events.last(self.trip_id);
                actions.extend(self.send_control(
                    Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Trip, after }),
                    now,
                ));
            },
        }

        let up_to = self.events.last(self.trip_id);
        actions.extend(self.send_control(Payload::Ack(Ack { stream: StreamKind::Trip, up_to }), now));
        actions
    }

    /// Whether `from` holds the role `event.actor` names on this trip.
    ///
    /// Cancels are relayed by whichever replica applied them, so any
    /// participant may carry one. A driver is only known once matched; before
    /// that any sender other than the passenger and the system passes.
    fn sender_may_emit(&self, from: UserId, event: &TripEvent) -> bool {
        let trip = self.trip();
        let driver_ok = match trip.driver {
            Some(driver) => from == driver,
            None => from != trip.passenger && from != UserId::SYSTEM,
        };
        let passenger_ok = from == trip.passenger;
        let system_ok = from == UserId::SYSTEM;

        if event.to == TripState::Cancelled {
            return passenger_ok || system_ok || driver_ok;
        }
        match event.actor {
            Actor::Passenger => passenger_ok,
            Actor::Driver => driver_ok,
            Actor::System => system_ok,
        }
    }

    fn apply_event(&mut self, event: &TripEvent, now: I, actions: &mut Vec<TripAction>) {
        let before = self.trip().version;
        match self.machine.apply(event) {
            // Second cancel of an already cancelled trip
            Ok(trip) if trip.version == before => {},
            Ok(trip) => {
                tracing::info!(
                    trip_id = %self.trip_id,
                    version = trip.version,
                    state = %trip.state,
                    actor = %event.actor,
                    "Applied remote transition"
                );
                self.trip_changed(trip, now, actions);
            },
            Err(rejected) if event.to == TripState::Cancelled => {
                tracing::debug!(trip_id = %self.trip_id, error = %rejected, "Cancel raced local state");
                self.apply_racing_cancel(event, now, actions);
            },
            Err(rejected) if rejected.reason == RejectReason::VersionGap => {
                tracing::warn!(trip_id = %self.trip_id, error = %rejected, "Machine behind sequencer");
                let after = self.trip().version;
                actions.extend(self.send_control(
                    Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Trip, after }),
                    now,
                ));
            },
            Err(rejected) => {
                tracing::warn!(trip_id = %self.trip_id, error = %rejected, "Rejected remote transition");
            },
        }
    }

    /// A cancel that overturned local state is re-sent at the new version.
    /// Peers that only saw the transition it beat, or joined from a snapshot
    /// taken before it, learn of it from here.
    fn apply_racing_cancel(&mut self, event: &TripEvent, now: I, actions: &mut Vec<TripAction>) {
        let already = self.trip().state == TripState::Cancelled;
        match self.machine.apply_racing_cancel(event) {
            Ok(trip) if !already => {
                let relay = TripEvent { version: trip.version, ..event.clone() };
                self.trip_changed(trip, now, actions);
                match self.send_payload(Payload::TripEvent(relay), now) {
                    Ok(sent) => actions.extend(sent),
                    Err(e) => tracing::debug!(trip_id = %self.trip_id, error = %e, "Cancel relay not sent"),
                }
            },
            Ok(_) => {},
            Err(rejected) => {
                tracing::warn!(trip_id = %self.trip_id, error = %rejected, "Rejected cancel");
            },
        }
    }

    fn on_chat_message(&mut self, message: ChatMessage, now: I) -> Vec<TripAction> {
        let sender = message.sender;
        let mut actions = Vec::new();

        match self.chat.on_receive(message, now) {
            ChatReceive::Appended(batch) => {
                actions.extend(batch.into_iter().map(TripAction::ChatAppended));
            },
            ChatReceive::Buffered | ChatReceive::Duplicate => {},
            ChatReceive::Overflow => {
                let after = self.chat.last_seen(sender);
                actions.extend(self.send_control(
                    Payload::ResyncRequest(ResyncRequest { stream: StreamKind::Chat { sender }, after }),
                    now,
                ));
            },
        }

        let stream = StreamKind::Chat { sender };
        let up_to = self.chat.last_seen(sender);
        actions.extend(self.send_control(Payload::Ack(Ack { stream, up_to }), now));
        actions
    }

    fn on_resync_request(&mut self, from: UserId, request: &ResyncRequest, now: I) -> Vec<TripAction> {
        // The requester holds everything up to `after`.
        self.channel.ack(self.trip_id, from, &Ack { stream: request.stream, up_to: request.after });

        match request.stream {
            StreamKind::Trip => {
                let trip = self.trip().clone();
                tracing::debug!(
                    trip_id = %self.trip_id,
                    requester = %from,
                    after = request.after,
                    version = trip.version,
                    "Answering trip resync"
                );
                self.send_control(Payload::ResyncResponse(ResyncResponse { trip }), now)
            },
            StreamKind::Chat { sender } if sender == self.local => {
                let resend: Vec<ChatMessage> = self.chat.own_messages_after(request.after).cloned().collect();
                let mut actions = Vec::new();
                for message in resend {
                    match self.send_payload(Payload::ChatMessage(message), now) {
                        Ok(sent) => actions.extend(sent),
                        Err(e) => {
                            tracing::debug!(trip_id = %self.trip_id, error = %e, "Chat resync interrupted");
                            break;
                        },
                    }
                }
                actions
            },
            StreamKind::Chat { .. } => Vec::new(),
        }
    }

    fn on_resync_response(&mut self, snapshot: &Trip, now: I) -> Vec<TripAction> {
        let mut actions = Vec::new();
        if self.machine.restore(snapshot) {
            let trip = self.trip().clone();
            tracing::info!(
                trip_id = %self.trip_id,
                version = trip.version,
                state = %trip.state,
                "Restored from resync snapshot"
            );
            self.trip_changed(trip, now, &mut actions);
        }
        actions
    }

    fn submit(&mut self, actor: Actor, desired: TripState, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        if actor != self.role {
            let trip = self.trip();
            return Err(RejectedTransition {
                reason: RejectReason::InvalidTransition,
                trip_id: self.trip_id,
                current: trip.state,
                version: trip.version,
                from: trip.state,
                to: desired,
                actor,
                attempted: trip.version + 1,
            }
            .into());
        }

        let event = self.machine.request_transition(desired, actor)?;
        self.commit_local(event, now)
    }

    fn assign_driver(&mut self, driver: UserId, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        if self.role != Actor::System {
            let trip = self.trip();
            return Err(RejectedTransition {
                reason: RejectReason::InvalidTransition,
                trip_id: self.trip_id,
                current: trip.state,
                version: trip.version,
                from: trip.state,
                to: TripState::Matched,
                actor: self.role,
                attempted: trip.version + 1,
            }
            .into());
        }

        let event = self.machine.request_match(driver)?;
        self.commit_local(event, now)
    }

    /// Send the event, then commit it. Nothing changes if the send fails.
    fn commit_local(&mut self, event: TripEvent, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        let mut actions = self.send_payload(Payload::TripEvent(event.clone()), now)?;

        let trip = self.machine.apply(&event)?;
        tracing::info!(
            trip_id = %self.trip_id,
            version = trip.version,
            state = %trip.state,
            actor = %event.actor,
            "Committed local transition"
        );
        self.trip_changed(trip, now, &mut actions);
        Ok(actions)
    }

    fn gesture_release(&mut self, now: I) -> Vec<TripAction> {
        let Some(target) = self.gate.release() else {
            return Vec::new();
        };

        match self.submit(self.role, target, now) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!(trip_id = %self.trip_id, target = %target, error = %e, "Gesture submission failed");
                self.gate.fail();
                vec![TripAction::Alert(Alert::GestureFailed(e))]
            },
        }
    }

    fn post_chat(&mut self, body: &str, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(crate::error::ChannelError::NotConnected { trip_id: self.trip_id }.into());
        }

        let sent_at = self.machine.tick_clock();
        let message = self.chat.post(body, sent_at)?;
        let mut actions = self.send_payload(Payload::ChatMessage(message.clone()), now)?;
        actions.push(TripAction::ChatAppended(message));
        Ok(actions)
    }

    /// Bookkeeping after every accepted change to the trip.
    fn trip_changed(&mut self, trip: Trip, now: I, actions: &mut Vec<TripAction>) {
        self.gate.observe(trip.state);
        self.update_peers();

        if trip.cancellation_reason == Some(CancellationReason::NoDriverFound) {
            actions.push(TripAction::Alert(Alert::NoDriverFound));
        }
        if trip.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }

        let version = trip.version;
        actions.push(TripAction::TripChanged(trip));

        // Keep the sequencer level with the machine and replay anything that
        // was waiting on this version.
        let ready = self.events.reset_to(self.trip_id, version, now);
        for event in &ready {
            self.apply_event(event, now, actions);
        }
    }

    fn update_peers(&mut self) {
        let trip = self.machine.trip();
        let peers: Vec<UserId> = [Some(trip.passenger), trip.driver, Some(UserId::SYSTEM)]
            .into_iter()
            .flatten()
            .filter(|peer| *peer != self.local)
            .collect();
        self.channel.set_peers(self.trip_id, peers);
    }

    fn send_payload(&mut self, payload: Payload, now: I) -> Result<Vec<TripAction>, CoordinatorError> {
        let stream = match &payload {
            Payload::TripEvent(_) => Some(StreamKind::Trip),
            Payload::ChatMessage(message) => Some(StreamKind::Chat { sender: message.sender }),
            Payload::ResyncRequest(_) | Payload::ResyncResponse(_) | Payload::Ack(_) => None,
        };
        let frame = payload.into_frame(self.trip_id, self.local)?;
        let sent = self.channel.send(self.trip_id, stream, frame, now)?;
        Ok(Self::map_channel(sent))
    }

    /// Best effort: control frames are dropped when the link is down.
    fn send_control(&mut self, payload: Payload, now: I) -> Vec<TripAction> {
        let kind = payload.kind();
        self.send_payload(payload, now).unwrap_or_else(|e| {
            tracing::debug!(trip_id = %self.trip_id, kind = %kind, error = %e, "Control frame not sent");
            Vec::new()
        })
    }

    fn close(&mut self) -> Vec<TripAction> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        tracing::info!(trip_id = %self.trip_id, state = %self.trip().state, "Closing trip channel");
        Self::map_channel(self.channel.disconnect(self.trip_id))
    }

    fn map_channel(actions: Vec<ChannelAction>) -> Vec<TripAction> {
        actions
            .into_iter()
            .map(|action| match action {
                ChannelAction::OpenLink { attempt, .. } => TripAction::OpenLink { attempt },
                ChannelAction::CloseLink { .. } => TripAction::CloseLink,
                ChannelAction::Transmit { frame, .. } => TripAction::SendFrame(frame),
                ChannelAction::StatusChanged { status, .. } => TripAction::StatusChanged(status),
            })
            .collect()
    }
}
