//! Simulated trip world.
//!
//! A passenger coordinator, a dispatcher, and (once matched) a driver
//! coordinator run against a [`SimNetwork`] on virtual time. Each
//! [`TripWorld::step`] advances the clock, delivers due frames, runs every
//! participant's timers, and lets the scripted [`Scenario`] act. After each
//! step the observable state is checked against an [`InvariantRegistry`].

use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
    time::Duration,
};

use rideflow_core::{
    Alert, CoordinatorConfig, CoordinatorError, DispatchAction, DispatchConfig, Dispatcher, Environment,
    GatePhase, TripAction, TripCoordinator, TripInput,
};
use rideflow_proto::{Actor, Trip, TripId, TripState, UserId};

use crate::{
    invariants::{InvariantRegistry, NodeSnapshot, Violation, WorldSnapshot},
    network::{NetworkConfig, NetworkStats, NodeId, SimNetwork},
    scenario::Scenario,
    sim_env::{SimEnv, SimInstant},
};

/// Passenger in every simulated trip.
pub const PASSENGER: UserId = UserId::new(100);

/// Driver who accepts simulated trips.
pub const DRIVER: UserId = UserId::new(200);

/// Simulation settings
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// RNG seed; the same seed replays the same run
    pub seed: u64,
    /// Network faults
    pub network: NetworkConfig,
    /// Settings for every participant's coordinator
    pub coordinator: CoordinatorConfig,
    /// How long the dispatcher searches before giving up
    pub search_timeout: Duration,
    /// Virtual time per step
    pub step: Duration,
    /// Give up if the world has not settled by then
    pub deadline: Duration,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            network: NetworkConfig::reliable(),
            // Long enough for a partitioned peer to reconnect before the
            // others stop retransmitting
            coordinator: CoordinatorConfig { linger: Duration::from_secs(30), ..CoordinatorConfig::default() },
            search_timeout: rideflow_core::dispatch::DEFAULT_SEARCH_TIMEOUT,
            step: Duration::from_millis(10),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Seed the run used
    pub seed: u64,
    /// Virtual time taken
    pub elapsed: Duration,
    /// Every participant closed before the deadline
    pub settled: bool,
    /// Final view per participant
    pub trips: BTreeMap<NodeId, Trip>,
    /// Trip notifications shown per participant
    pub notifications: BTreeMap<NodeId, usize>,
    /// Alerts raised per participant
    pub alerts: BTreeMap<NodeId, Vec<Alert>>,
    /// Network counters
    pub network: NetworkStats,
}

impl RunReport {
    /// State the passenger ended in.
    pub fn passenger_state(&self) -> Option<TripState> {
        self.trips.get(&NodeId::Passenger).map(|trip| trip.state)
    }
}

#[derive(Debug, Default)]
struct Script {
    accepted: bool,
    departed: bool,
    matched_at: Option<SimInstant>,
    driver_busy_since: Option<SimInstant>,
    passenger_cancel_done: bool,
    driver_cancel_done: bool,
    passenger_chatted: bool,
    driver_replied: bool,
    partitioned: bool,
}

/// One trip, three participants, one network.
#[derive(Debug)]
pub struct TripWorld {
    config: WorldConfig,
    env: SimEnv,
    network: SimNetwork,
    scenario: Scenario,
    trip_id: TripId,
    passenger: TripCoordinator<SimInstant>,
    driver: Option<TripCoordinator<SimInstant>>,
    dispatcher: Dispatcher<SimInstant>,
    links: BTreeSet<NodeId>,
    records: BTreeMap<NodeId, NodeSnapshot>,
    alerts: BTreeMap<NodeId, Vec<Alert>>,
    script: Script,
    started: bool,
}

impl TripWorld {
    /// Build a world for `scenario`. Nothing runs until [`TripWorld::start`].
    pub fn new(config: WorldConfig, scenario: Scenario) -> Self {
        let env = SimEnv::with_seed(config.seed);
        let network = SimNetwork::new(config.network.clone(), env.clone());
        let trip_id = TripId::new(env.random_u128());
        let trip = Trip::requested(trip_id, PASSENGER);
        let now = env.now();

        let passenger =
            TripCoordinator::new(trip.clone(), PASSENGER, Actor::Passenger, config.coordinator.clone(), now);
        let dispatcher = Dispatcher::new(DispatchConfig {
            search_timeout: config.search_timeout,
            coordinator: config.coordinator.clone(),
        });

        let mut records = BTreeMap::new();
        records.insert(NodeId::Passenger, NodeSnapshot::new(NodeId::Passenger, PASSENGER, trip.clone()));
        records.insert(NodeId::Dispatcher, NodeSnapshot::new(NodeId::Dispatcher, UserId::SYSTEM, trip));

        Self {
            config,
            env,
            network,
            scenario,
            trip_id,
            passenger,
            driver: None,
            dispatcher,
            links: BTreeSet::new(),
            records,
            alerts: BTreeMap::new(),
            script: Script::default(),
            started: false,
        }
    }

    /// Trip being simulated.
    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Current view of a participant, if it exists yet.
    pub fn trip(&self, node: NodeId) -> Option<&Trip> {
        self.records.get(&node).map(|record| &record.trip)
    }

    /// Passenger submits the trip and the dispatcher picks it up.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let now = self.env.now();
        tracing::info!(trip_id = %self.trip_id, seed = self.config.seed, scenario = %self.scenario.kind, "Starting trip");

        let actions = self.passenger.start();
        self.execute(NodeId::Passenger, actions);

        let trip = self.passenger.trip().clone();
        let actions = untag(self.dispatcher.open_trip(trip, now));
        self.execute(NodeId::Dispatcher, actions);
    }

    /// Every participant that exists has closed its channel.
    pub fn is_settled(&self) -> bool {
        self.started && self.records.values().all(|record| record.closed)
    }

    /// Observable state of every participant.
    pub fn snapshot(&self) -> WorldSnapshot {
        let snapshot = WorldSnapshot::from_nodes(self.records.values().cloned().collect());
        if self.is_settled() { snapshot.settled() } else { snapshot }
    }

    /// Advance one step.
    pub fn step(&mut self) {
        self.start();
        self.env.advance(self.config.step);
        let now = self.env.now();

        self.apply_partition(now);

        for (to, frame) in self.network.deliver_due(now) {
            if !self.links.contains(&to) {
                self.network.record_lost();
                continue;
            }
            self.network.record_delivered();
            let actions = self.feed(to, TripInput::FrameReceived(frame));
            self.execute(to, actions);
        }

        let actions = self.feed(NodeId::Passenger, TripInput::Tick);
        self.execute(NodeId::Passenger, actions);
        if self.driver.is_some() {
            let actions = self.feed(NodeId::Driver, TripInput::Tick);
            self.execute(NodeId::Driver, actions);
        }
        let actions = untag(self.dispatcher.tick(now));
        self.execute(NodeId::Dispatcher, actions);

        self.run_script(now);
    }

    /// Step until settled or the deadline, checking `invariants` after every
    /// step.
    ///
    /// # Errors
    ///
    /// Every violation found at the first step that broke an invariant.
    pub fn run(&mut self, invariants: &InvariantRegistry) -> Result<RunReport, Vec<Violation>> {
        self.start();
        invariants.check_all(&self.snapshot())?;

        while !self.is_settled() && self.env.now().since_start() < self.config.deadline {
            self.step();
            invariants.check_all(&self.snapshot())?;
        }

        let report = self.report();
        tracing::info!(
            trip_id = %self.trip_id,
            settled = report.settled,
            elapsed = ?report.elapsed,
            state = ?report.passenger_state(),
            sent = report.network.sent,
            dropped = report.network.dropped,
            "Run finished"
        );
        Ok(report)
    }

    /// Summary of the run so far.
    pub fn report(&self) -> RunReport {
        RunReport {
            seed: self.config.seed,
            elapsed: self.env.now().since_start(),
            settled: self.is_settled(),
            trips: self.records.iter().map(|(node, record)| (*node, record.trip.clone())).collect(),
            notifications: self.records.iter().map(|(node, record)| (*node, record.notifications.len())).collect(),
            alerts: self.alerts.clone(),
            network: self.network.stats(),
        }
    }

    fn feed(&mut self, node: NodeId, input: TripInput) -> Vec<TripAction> {
        let now = self.env.now();
        let result = match node {
            NodeId::Passenger => self.passenger.handle(input, now),
            NodeId::Driver => match self.driver.as_mut() {
                Some(driver) => driver.handle(input, now),
                None => Ok(Vec::new()),
            },
            NodeId::Dispatcher => self.dispatcher.handle(self.trip_id, input, now).map(untag),
        };

        match result {
            Ok(actions) => actions,
            // The dispatcher forgets trips once their channel closes
            Err(CoordinatorError::Closed { .. }) => Vec::new(),
            Err(e) => {
                tracing::debug!(%node, error = %e, "Input refused");
                Vec::new()
            },
        }
    }

    fn execute(&mut self, node: NodeId, actions: Vec<TripAction>) {
        let mut pending = actions;

        while !pending.is_empty() {
            for action in mem::take(&mut pending) {
                match action {
                    TripAction::OpenLink { attempt } => {
                        let input = if self.network.is_partitioned(node) {
                            tracing::debug!(%node, attempt, "Connect failed");
                            TripInput::LinkDown { reason: "partitioned".into() }
                        } else {
                            self.links.insert(node);
                            TripInput::LinkUp
                        };
                        pending.extend(self.feed(node, input));
                    },
                    TripAction::CloseLink => {
                        self.links.remove(&node);
                        if let Some(record) = self.records.get_mut(&node) {
                            record.closed = true;
                        }
                    },
                    TripAction::SendFrame(frame) => {
                        if self.links.contains(&node) {
                            self.network.broadcast(node, &frame);
                        }
                    },
                    TripAction::TripChanged(trip) => {
                        if let Some(record) = self.records.get_mut(&node) {
                            record.record(trip);
                        }
                        if node == NodeId::Driver {
                            self.script.driver_busy_since = Some(self.env.now());
                        }
                    },
                    TripAction::ChatAppended(message) => {
                        if let Some(record) = self.records.get_mut(&node) {
                            record.chat.push(message);
                        }
                    },
                    TripAction::StatusChanged(status) => {
                        tracing::trace!(%node, %status, "Status changed");
                    },
                    TripAction::Alert(alert) => {
                        tracing::debug!(%node, ?alert, "Alert");
                        self.alerts.entry(node).or_default().push(alert);
                    },
                }
            }
        }
    }

    fn apply_partition(&mut self, now: SimInstant) {
        let Some(partition) = self.scenario.partition else {
            return;
        };

        let elapsed = now.since_start();
        let cut = elapsed >= partition.from && elapsed < partition.until;
        if cut == self.script.partitioned {
            return;
        }

        self.script.partitioned = cut;
        self.network.set_partitioned(partition.node, cut);
        tracing::info!(node = %partition.node, cut, "Partition changed");

        if cut && self.links.remove(&partition.node) {
            let actions = self.feed(partition.node, TripInput::LinkDown { reason: "partitioned".into() });
            self.execute(partition.node, actions);
        }
    }

    fn run_script(&mut self, now: SimInstant) {
        let elapsed = now.since_start();
        self.run_dispatcher(now, elapsed);
        self.run_driver(now, elapsed);
        self.run_passenger(elapsed);
    }

    fn run_dispatcher(&mut self, now: SimInstant, elapsed: Duration) {
        let Some(trip) = self.dispatcher.trip(self.trip_id).cloned() else {
            return;
        };

        if !self.script.accepted
            && let Some(accept_after) = self.scenario.accept_after
            && elapsed >= accept_after
        {
            match self.dispatcher.driver_accepted(self.trip_id, DRIVER, now) {
                Ok(actions) => {
                    self.script.accepted = true;
                    self.script.matched_at = Some(now);
                    self.execute(NodeId::Dispatcher, untag(actions));
                    self.spawn_driver(now);
                },
                Err(e) if e.is_transient() => {},
                Err(e) => {
                    tracing::debug!(error = %e, "Driver acceptance refused");
                    self.script.accepted = true;
                },
            }
            return;
        }

        if !self.script.departed
            && trip.state == TripState::Matched
            && let Some(matched_at) = self.script.matched_at
            && now - matched_at >= self.scenario.depart_after
        {
            match self.dispatcher.driver_departed(self.trip_id, now) {
                Ok(actions) => {
                    self.script.departed = true;
                    self.execute(NodeId::Dispatcher, untag(actions));
                },
                Err(e) if e.is_transient() => {},
                Err(_) => self.script.departed = true,
            }
        }
    }

    /// The driver's app joins from the dispatcher's view of the trip.
    fn spawn_driver(&mut self, now: SimInstant) {
        let Some(trip) = self.dispatcher.trip(self.trip_id).cloned() else {
            return;
        };

        tracing::info!(trip_id = %self.trip_id, driver = %DRIVER, version = trip.version, "Driver joining");
        self.records.insert(NodeId::Driver, NodeSnapshot::new(NodeId::Driver, DRIVER, trip.clone()));
        self.script.driver_busy_since = Some(now);

        let mut driver = TripCoordinator::new(trip, DRIVER, Actor::Driver, self.config.coordinator.clone(), now);
        let actions = driver.start();
        self.driver = Some(driver);
        self.execute(NodeId::Driver, actions);
    }

    fn run_driver(&mut self, now: SimInstant, elapsed: Duration) {
        let Some(driver) = self.driver.as_ref() else {
            return;
        };
        let state = driver.trip().state;
        let phase = driver.gate_phase();
        let heard_passenger = driver.chat_log().iter().any(|m| m.sender == PASSENGER);

        if !self.script.driver_cancel_done
            && let Some(at) = self.scenario.driver_cancel_at
            && elapsed >= at
        {
            let result = self.intent(NodeId::Driver, TripInput::Submit { actor: Actor::Driver, desired: TripState::Cancelled });
            self.script.driver_cancel_done = result.is_some();
            return;
        }

        if self.scenario.chat && heard_passenger && !self.script.driver_replied {
            let post = TripInput::PostChat { body: "Two minutes away".into() };
            self.script.driver_replied = self.intent(NodeId::Driver, post).is_some();
        }

        let rested = self.script.driver_busy_since.is_none_or(|since| now - since >= self.scenario.driver_pace);
        let ready = matches!(phase, GatePhase::Armed | GatePhase::Confirmed { .. });
        if rested && ready && rideflow_core::gate::gesture_target(state).is_some() {
            self.script.driver_busy_since = Some(now);
            for input in [TripInput::GestureStart, TripInput::GestureMove { progress: 1.0 }, TripInput::GestureRelease] {
                let actions = self.feed(NodeId::Driver, input);
                self.execute(NodeId::Driver, actions);
            }
        }
    }

    fn run_passenger(&mut self, elapsed: Duration) {
        let state = self.passenger.trip().state;

        if !self.script.passenger_cancel_done
            && let Some(at) = self.scenario.passenger_cancel_at
            && elapsed >= at
        {
            let cancel = TripInput::Submit { actor: Actor::Passenger, desired: TripState::Cancelled };
            self.script.passenger_cancel_done = self.intent(NodeId::Passenger, cancel).is_some();
            return;
        }

        if self.scenario.chat
            && !self.script.passenger_chatted
            && !state.is_terminal()
            && state != TripState::Requested
        {
            let post = TripInput::PostChat { body: "I'm at the north entrance".into() };
            self.script.passenger_chatted = self.intent(NodeId::Passenger, post).is_some();
        }
    }

    /// Submit a user intent. `None` means try again later; `Some` means the
    /// intent is done with, accepted or refused for good.
    fn intent(&mut self, node: NodeId, input: TripInput) -> Option<bool> {
        let now = self.env.now();
        let result = match node {
            NodeId::Passenger => self.passenger.handle(input, now),
            NodeId::Driver => self.driver.as_mut()?.handle(input, now),
            NodeId::Dispatcher => self.dispatcher.handle(self.trip_id, input, now).map(untag),
        };

        match result {
            Ok(actions) => {
                self.execute(node, actions);
                Some(true)
            },
            Err(e) if e.is_transient() => None,
            Err(e) => {
                tracing::debug!(%node, error = %e, "Intent refused");
                Some(false)
            },
        }
    }
}

fn untag(actions: Vec<DispatchAction>) -> Vec<TripAction> {
    actions.into_iter().map(|tagged| tagged.action).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioKind;

    fn run(kind: ScenarioKind, config: WorldConfig) -> RunReport {
        let mut world = TripWorld::new(config, Scenario::new(kind));
        world.run(&InvariantRegistry::standard()).unwrap()
    }

    #[test]
    fn reliable_ride_completes_everywhere() {
        let report = run(ScenarioKind::Complete, WorldConfig::default());

        assert!(report.settled);
        assert!(report.trips.values().all(|trip| trip.state == TripState::Completed));
        assert_eq!(report.notifications[&NodeId::Passenger], 5);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn same_seed_same_run() {
        let config = WorldConfig { seed: 11, network: NetworkConfig::lossy(0.2), ..WorldConfig::default() };
        let a = run(ScenarioKind::PassengerCancels, config.clone());
        let b = run(ScenarioKind::PassengerCancels, config);

        assert_eq!(a.elapsed, b.elapsed);
        assert_eq!(a.network, b.network);
        assert_eq!(a.trips, b.trips);
    }

    #[test]
    fn world_is_lazy_until_started() {
        let world = TripWorld::new(WorldConfig::default(), Scenario::default());
        assert!(!world.is_settled());
        assert!(world.trip(NodeId::Driver).is_none());
        assert_eq!(world.trip(NodeId::Passenger).map(|t| t.state), Some(TripState::Requested));
    }
}
