//! Per-trip actor runtime.
//!
//! Each trip runs in its own Tokio task that owns the trip's
//! [`TripCoordinator`]. Every mutation (UI command, inbound frame, timer
//! tick) is serialized through that task, so the coordinator sees a single
//! timeline. UIs talk to the task through a cloneable [`TripHandle`].
//!
//! ```text
//! TripHandle ──mpsc──> TripTask ──> TripCoordinator
//!     ^                   │  ^
//!     │ broadcast/watch   │  │ frames
//!     └───────────────────┘  └── Link (Connector)
//! ```

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rideflow_core::{
    Alert, ConnectionStatus, CoordinatorError, Environment, GatePhase, TripAction, TripCoordinator,
    TripInput,
};
use rideflow_proto::{Actor, ChatMessage, Frame, Trip, TripId, TripState, UserId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

use crate::{
    config::ClientConfig,
    error::SubmitError,
    history::{TripHistory, TripRecord},
    transport::{Connector, Link},
};

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

#[derive(Debug)]
enum Command {
    Submit { actor: Actor, desired: TripState, reply: Reply<Trip> },
    AssignDriver { driver: UserId, reply: Reply<Trip> },
    Gesture(TripInput),
    PostChat { body: String, reply: Reply<ChatMessage> },
    ChatLog { reply: oneshot::Sender<Vec<ChatMessage>> },
    GatePhase { reply: oneshot::Sender<GatePhase> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// One participant's entry point: opens trips and keeps their history.
#[derive(Debug, Clone)]
pub struct RideClient<E, C> {
    env: E,
    connector: C,
    user: UserId,
    role: Actor,
    config: ClientConfig,
    history: Arc<Mutex<TripHistory>>,
}

impl<E, C> RideClient<E, C>
where
    E: Environment,
    C: Connector,
{
    /// Create a client for `user` acting as `role`.
    pub fn new(env: E, connector: C, user: UserId, role: Actor, config: ClientConfig) -> Self {
        Self { env, connector, user, role, config, history: Arc::default() }
    }

    /// The local participant.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// The local role.
    pub fn role(&self) -> Actor {
        self.role
    }

    /// Request a new trip with the local user as passenger.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_trip(&self) -> TripHandle {
        let trip_id = TripId::new(self.env.random_u128());
        tracing::info!(trip_id = %trip_id, passenger = %self.user, "Requesting trip");
        self.join_trip(Trip::requested(trip_id, self.user))
    }

    /// Run an existing trip from a snapshot, e.g. a driver joining the trip
    /// they accepted or the dispatcher picking up a new request.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join_trip(&self, trip: Trip) -> TripHandle {
        let trip_id = trip.id;
        let config = &self.config;

        let (commands_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (trips, trips_rx) = broadcast::channel(config.event_capacity.max(1));
        let (chat, chat_rx) = broadcast::channel(config.event_capacity.max(1));
        let (alerts, alerts_rx) = broadcast::channel(config.event_capacity.max(1));
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (snapshot, snapshot_rx) = watch::channel(trip.clone());

        let now = self.env.now();
        let task = TripTask {
            coordinator: TripCoordinator::new(trip, self.user, self.role, config.coordinator.clone(), now),
            env: self.env.clone(),
            connector: self.connector.clone(),
            user: self.user,
            link: None,
            commands,
            trips,
            chat,
            alerts,
            status,
            snapshot,
            history: Arc::clone(&self.history),
            tick_interval: config.tick_interval,
            last_tick: now,
        };
        let span = tracing::info_span!("trip", trip_id = %trip_id, user = %self.user);
        tokio::spawn(task.run().instrument(span));

        TripHandle {
            trip_id,
            commands: commands_tx,
            trips: trips_rx,
            chat: chat_rx,
            alerts: alerts_rx,
            status: status_rx,
            snapshot: snapshot_rx,
        }
    }

    /// Finished trips, most recent first.
    pub fn history(&self) -> Vec<TripRecord> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).records()
    }
}

/// Handle to one trip's runtime task.
///
/// Cheap to clone. Once the task exits (the trip finished and its channel
/// closed, or [`TripHandle::shutdown`] was called), requests fail with
/// [`SubmitError::Stopped`] and subscriptions end.
#[derive(Debug)]
pub struct TripHandle {
    trip_id: TripId,
    commands: mpsc::Sender<Command>,
    trips: broadcast::Receiver<Trip>,
    chat: broadcast::Receiver<ChatMessage>,
    alerts: broadcast::Receiver<Alert>,
    status: watch::Receiver<ConnectionStatus>,
    snapshot: watch::Receiver<Trip>,
}

impl Clone for TripHandle {
    fn clone(&self) -> Self {
        Self {
            trip_id: self.trip_id,
            commands: self.commands.clone(),
            trips: self.trips.resubscribe(),
            chat: self.chat.resubscribe(),
            alerts: self.alerts.resubscribe(),
            status: self.status.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl TripHandle {
    /// Trip identifier.
    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    /// Latest trip snapshot.
    pub fn trip(&self) -> Trip {
        self.snapshot.borrow().clone()
    }

    /// Receive every accepted transition from now on.
    pub fn subscribe_trip(&self) -> broadcast::Receiver<Trip> {
        self.trips.resubscribe()
    }

    /// Receive every chat message appended from now on.
    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatMessage> {
        self.chat.resubscribe()
    }

    /// Receive user-facing alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.resubscribe()
    }

    /// Current connection status, for reconnecting banners.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Watch the trip snapshot.
    pub fn watch_trip(&self) -> watch::Receiver<Trip> {
        self.snapshot.clone()
    }

    /// Request a transition. Resolves with the committed trip once the
    /// channel accepted the event.
    ///
    /// # Errors
    ///
    /// - `Refused` with the coordinator's reason (illegal transition, not
    ///   connected)
    /// - `Stopped` if the trip's task exited
    pub async fn submit_action(&self, actor: Actor, desired: TripState) -> Result<Trip, SubmitError> {
        self.request(|reply| Command::Submit { actor, desired, reply }).await?.map_err(Into::into)
    }

    /// Match `driver` to the trip. Dispatcher only.
    ///
    /// # Errors
    ///
    /// See [`TripHandle::submit_action`].
    pub async fn assign_driver(&self, driver: UserId) -> Result<Trip, SubmitError> {
        self.request(|reply| Command::AssignDriver { driver, reply }).await?.map_err(Into::into)
    }

    /// Begin a confirmation gesture.
    ///
    /// # Errors
    ///
    /// - `Stopped` if the trip's task exited
    pub async fn gesture_start(&self) -> Result<(), SubmitError> {
        self.send(Command::Gesture(TripInput::GestureStart)).await
    }

    /// Report gesture progress, 0.0 to 1.0.
    ///
    /// # Errors
    ///
    /// - `Stopped` if the trip's task exited
    pub async fn gesture_move(&self, progress: f32) -> Result<(), SubmitError> {
        self.send(Command::Gesture(TripInput::GestureMove { progress })).await
    }

    /// End the gesture. A failed submission shows up as
    /// [`Alert::GestureFailed`].
    ///
    /// # Errors
    ///
    /// - `Stopped` if the trip's task exited
    pub async fn gesture_release(&self) -> Result<(), SubmitError> {
        self.send(Command::Gesture(TripInput::GestureRelease)).await
    }

    /// Current gesture gate phase.
    ///
    /// # Errors
    ///
    /// - `Stopped` if the trip's task exited
    pub async fn gate_phase(&self) -> Result<GatePhase, SubmitError> {
        self.request(|reply| Command::GatePhase { reply }).await
    }

    /// Post a chat message to the counterpart.
    ///
    /// # Errors
    ///
    /// - `Refused` if the body is invalid or the trip is not connected
    /// - `Stopped` if the trip's task exited
    pub async fn post_chat(&self, body: impl Into<String>) -> Result<ChatMessage, SubmitError> {
        let body = body.into();
        self.request(|reply| Command::PostChat { body, reply }).await?.map_err(Into::into)
    }

    /// The chat log so far.
    ///
    /// # Errors
    ///
    /// - `Stopped` if the trip's task exited
    pub async fn chat_log(&self) -> Result<Vec<ChatMessage>, SubmitError> {
        self.request(|reply| Command::ChatLog { reply }).await
    }

    /// Close the trip's connection and stop its task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn send(&self, command: Command) -> Result<(), SubmitError> {
        self.commands.send(command).await.map_err(|_| SubmitError::Stopped { trip_id: self.trip_id })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SubmitError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SubmitError::Stopped { trip_id: self.trip_id })
    }
}

struct TripTask<E: Environment, C> {
    coordinator: TripCoordinator<E::Instant>,
    env: E,
    connector: C,
    user: UserId,
    link: Option<Link>,
    commands: mpsc::Receiver<Command>,
    trips: broadcast::Sender<Trip>,
    chat: broadcast::Sender<ChatMessage>,
    alerts: broadcast::Sender<Alert>,
    status: watch::Sender<ConnectionStatus>,
    snapshot: watch::Sender<Trip>,
    history: Arc<Mutex<TripHistory>>,
    tick_interval: Duration,
    last_tick: E::Instant,
}

impl<E, C> TripTask<E, C>
where
    E: Environment,
    C: Connector,
{
    async fn run(mut self) {
        let actions = self.coordinator.start();
        self.execute(actions).await;

        while !self.coordinator.is_closed() {
            let since_tick = self.env.now() - self.last_tick;
            let wait = self.tick_interval.saturating_sub(since_tick);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // Every handle is gone
                    None => self.feed(TripInput::Shutdown).await,
                },
                frame = next_frame(self.link.as_mut()) => match frame {
                    Some(frame) => self.feed(TripInput::FrameReceived(frame)).await,
                    None => self.link_lost("link closed").await,
                },
                () = self.env.sleep(wait) => {},
            }

            let now = self.env.now();
            if now - self.last_tick >= self.tick_interval {
                self.last_tick = now;
                self.feed(TripInput::Tick).await;
            }
        }

        tracing::debug!(state = %self.coordinator.trip().state, "Trip task finished");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { actor, desired, reply } => {
                let result = self.request(TripInput::Submit { actor, desired }).await;
                let _ = reply.send(result.map(|()| self.coordinator.trip().clone()));
            },
            Command::AssignDriver { driver, reply } => {
                let result = self.request(TripInput::AssignDriver { driver }).await;
                let _ = reply.send(result.map(|()| self.coordinator.trip().clone()));
            },
            Command::Gesture(input) => self.feed(input).await,
            Command::PostChat { body, reply } => {
                let result = self.request(TripInput::PostChat { body }).await;
                let posted = result.map(|()| {
                    self.coordinator.chat_log().iter().rev().find(|m| m.sender == self.user).cloned()
                });
                let _ = reply.send(posted.and_then(|m| {
                    m.ok_or_else(|| CoordinatorError::Protocol("posted message missing from log".into()))
                }));
            },
            Command::ChatLog { reply } => {
                let _ = reply.send(self.coordinator.chat_log().to_vec());
            },
            Command::GatePhase { reply } => {
                let _ = reply.send(self.coordinator.gate_phase());
            },
            Command::Shutdown { reply } => {
                self.feed(TripInput::Shutdown).await;
                let _ = reply.send(());
            },
        }
    }

    /// Feed a user intent and execute its actions.
    async fn request(&mut self, input: TripInput) -> Result<(), CoordinatorError> {
        let actions = self.coordinator.handle(input, self.env.now())?;
        self.execute(actions).await;
        Ok(())
    }

    /// Feed network or timer input; failures are logged, not returned.
    async fn feed(&mut self, input: TripInput) {
        match self.coordinator.handle(input, self.env.now()) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => tracing::warn!(error = %e, "Input refused"),
        }
    }

    async fn link_lost(&mut self, reason: &str) {
        self.link = None;
        self.feed(TripInput::LinkDown { reason: reason.to_string() }).await;
    }

    /// Execute actions, including those produced while executing.
    async fn execute(&mut self, initial: Vec<TripAction>) {
        let mut pending = initial;

        while !pending.is_empty() {
            for action in std::mem::take(&mut pending) {
                let follow_up = match action {
                    TripAction::OpenLink { attempt } => self.open_link(attempt).await,
                    TripAction::CloseLink => {
                        self.link = None;
                        None
                    },
                    TripAction::SendFrame(frame) => self.send_frame(frame).await,
                    TripAction::TripChanged(trip) => {
                        self.publish_trip(trip);
                        None
                    },
                    TripAction::ChatAppended(message) => {
                        let _ = self.chat.send(message);
                        None
                    },
                    TripAction::StatusChanged(status) => {
                        self.status.send_replace(status);
                        None
                    },
                    TripAction::Alert(alert) => {
                        let _ = self.alerts.send(alert);
                        None
                    },
                };

                if let Some(input) = follow_up {
                    match self.coordinator.handle(input, self.env.now()) {
                        Ok(actions) => pending.extend(actions),
                        Err(e) => tracing::warn!(error = %e, "Link event refused"),
                    }
                }
            }
        }
    }

    async fn open_link(&mut self, attempt: u32) -> Option<TripInput> {
        let trip_id = self.coordinator.trip_id();
        match self.connector.connect(trip_id, self.user).await {
            Ok(link) => {
                tracing::debug!(attempt, "Link open");
                self.link = Some(link);
                Some(TripInput::LinkUp)
            },
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Connect failed");
                Some(TripInput::LinkDown { reason: e.to_string() })
            },
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Option<TripInput> {
        let link = self.link.as_ref()?;
        if link.outbound.send(frame).await.is_ok() {
            return None;
        }
        self.link = None;
        Some(TripInput::LinkDown { reason: "link closed while sending".into() })
    }

    fn publish_trip(&self, trip: Trip) {
        if trip.is_terminal() {
            self.history.lock().unwrap_or_else(PoisonError::into_inner).record(&trip);
        }
        self.snapshot.send_replace(trip.clone());
        let _ = self.trips.send(trip);
    }
}

async fn next_frame(link: Option<&mut Link>) -> Option<Frame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}
