//! Dispatcher-side trip registry.
//!
//! The dispatcher participates in every trip as [`UserId::SYSTEM`]. It owns
//! the `Requested -> Matched -> DriverEnRoute` transitions and cancels trips
//! nobody accepted within the search window.

use std::{collections::BTreeMap, ops::Sub, time::Duration};

use rideflow_proto::{Actor, Frame, Trip, TripId, TripState, UserId};

use crate::{
    coordinator::{CoordinatorConfig, TripAction, TripCoordinator, TripInput},
    env::elapsed_at_least,
    error::CoordinatorError,
};

/// Default time a trip may wait for a driver.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a trip may stay `Requested` before it is cancelled with
    /// `NoDriverFound`
    pub search_timeout: Duration,
    /// Settings for each trip's coordinator
    pub coordinator: CoordinatorConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { search_timeout: DEFAULT_SEARCH_TIMEOUT, coordinator: CoordinatorConfig::default() }
    }
}

/// An action for one of the dispatcher's trips.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchAction {
    /// Trip the action belongs to
    pub trip_id: TripId,
    /// What to do
    pub action: TripAction,
}

#[derive(Debug)]
struct Dispatched<I> {
    coordinator: TripCoordinator<I>,
    opened_at: I,
}

/// Runs a system-role coordinator for every open trip.
#[derive(Debug)]
pub struct Dispatcher<I> {
    trips: BTreeMap<TripId, Dispatched<I>>,
    config: DispatchConfig,
}

impl<I> Dispatcher<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty dispatcher.
    pub fn new(config: DispatchConfig) -> Self {
        Self { trips: BTreeMap::new(), config }
    }

    /// Number of trips still tracked.
    pub fn len(&self) -> usize {
        self.trips.len()
    }

    /// Whether no trips are tracked.
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// Dispatcher's view of a trip.
    pub fn trip(&self, trip_id: TripId) -> Option<&Trip> {
        self.trips.get(&trip_id).map(|d| d.coordinator.trip())
    }

    /// Start tracking a trip and open its connection. The search window
    /// starts now.
    pub fn open_trip(&mut self, trip: Trip, now: I) -> Vec<DispatchAction> {
        let trip_id = trip.id;
        if self.trips.contains_key(&trip_id) {
            return Vec::new();
        }

        tracing::info!(trip_id = %trip_id, passenger = %trip.passenger, "Dispatching trip");

        let mut coordinator =
            TripCoordinator::new(trip, UserId::SYSTEM, Actor::System, self.config.coordinator.clone(), now);
        let actions = coordinator.start();
        self.trips.insert(trip_id, Dispatched { coordinator, opened_at: now });
        tag(trip_id, actions)
    }

    /// Forward an input to a trip's coordinator.
    ///
    /// # Errors
    ///
    /// - `CoordinatorError::Closed` if the trip is not tracked
    /// - Whatever the coordinator returns for the input
    pub fn handle(
        &mut self,
        trip_id: TripId,
        input: TripInput,
        now: I,
    ) -> Result<Vec<DispatchAction>, CoordinatorError> {
        let dispatched = self.trips.get_mut(&trip_id).ok_or(CoordinatorError::Closed { trip_id })?;
        let actions = dispatched.coordinator.handle(input, now)?;
        Ok(tag(trip_id, actions))
    }

    /// Route an inbound frame by its trip id.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::handle`].
    pub fn handle_frame(&mut self, frame: Frame, now: I) -> Result<Vec<DispatchAction>, CoordinatorError> {
        self.handle(frame.header.trip_id(), TripInput::FrameReceived(frame), now)
    }

    /// A driver accepted the trip: emit `Matched`.
    ///
    /// # Errors
    ///
    /// - `Rejected` unless the trip is still `Requested`
    /// - `Channel(NotConnected)` if the trip's link is down
    pub fn driver_accepted(
        &mut self,
        trip_id: TripId,
        driver: UserId,
        now: I,
    ) -> Result<Vec<DispatchAction>, CoordinatorError> {
        self.handle(trip_id, TripInput::AssignDriver { driver }, now)
    }

    /// The matched driver started driving to the pickup: emit
    /// `DriverEnRoute`.
    ///
    /// # Errors
    ///
    /// - `Rejected` unless the trip is `Matched`
    /// - `Channel(NotConnected)` if the trip's link is down
    pub fn driver_departed(&mut self, trip_id: TripId, now: I) -> Result<Vec<DispatchAction>, CoordinatorError> {
        self.handle(trip_id, TripInput::Submit { actor: Actor::System, desired: TripState::DriverEnRoute }, now)
    }

    /// Run every trip's timers, cancel searches that ran out, and forget
    /// trips whose channel closed.
    pub fn tick(&mut self, now: I) -> Vec<DispatchAction> {
        let search_timeout = self.config.search_timeout;
        let mut out = Vec::new();

        for (trip_id, dispatched) in &mut self.trips {
            let coordinator = &mut dispatched.coordinator;
            if let Ok(actions) = coordinator.handle(TripInput::Tick, now) {
                out.extend(tag(*trip_id, actions));
            }

            if coordinator.trip().state != TripState::Requested
                || !elapsed_at_least(now, dispatched.opened_at, search_timeout)
            {
                continue;
            }

            let cancel = TripInput::Submit { actor: Actor::System, desired: TripState::Cancelled };
            match coordinator.handle(cancel, now) {
                Ok(actions) => {
                    tracing::info!(trip_id = %trip_id, waited = ?search_timeout, "No driver found");
                    out.extend(tag(*trip_id, actions));
                },
                Err(e) => {
                    tracing::debug!(trip_id = %trip_id, error = %e, "Search timeout cancel deferred");
                },
            }
        }

        self.trips.retain(|trip_id, dispatched| {
            let keep = !dispatched.coordinator.is_closed();
            if !keep {
                tracing::debug!(trip_id = %trip_id, "Forgetting closed trip");
            }
            keep
        });

        out
    }
}

fn tag(trip_id: TripId, actions: Vec<TripAction>) -> Vec<DispatchAction> {
    actions.into_iter().map(|action| DispatchAction { trip_id, action }).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::ConnectionStatus;

    type T = Duration;

    const PASSENGER: UserId = UserId::new(7);
    const DRIVER: UserId = UserId::new(9);

    fn secs(s: u64) -> T {
        Duration::from_secs(s)
    }

    fn open() -> (Dispatcher<T>, TripId) {
        let mut dispatcher = Dispatcher::new(DispatchConfig::default());
        let trip_id = TripId::new(42);
        dispatcher.open_trip(Trip::requested(trip_id, PASSENGER), secs(0));
        dispatcher.handle(trip_id, TripInput::LinkUp, secs(0)).unwrap();
        (dispatcher, trip_id)
    }

    fn trip_changes(actions: &[DispatchAction]) -> Vec<Trip> {
        actions
            .iter()
            .filter_map(|a| match &a.action {
                TripAction::TripChanged(trip) => Some(trip.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn open_trip_connects() {
        let mut dispatcher = Dispatcher::<T>::new(DispatchConfig::default());
        let trip_id = TripId::new(1);
        let actions = dispatcher.open_trip(Trip::requested(trip_id, PASSENGER), secs(0));

        assert!(actions.iter().any(|a| a.action == TripAction::OpenLink { attempt: 0 }));
        assert!(actions.iter().all(|a| a.trip_id == trip_id));
        assert_eq!(dispatcher.len(), 1);

        // Opening twice is a no-op
        assert!(dispatcher.open_trip(Trip::requested(trip_id, PASSENGER), secs(1)).is_empty());
    }

    #[test]
    fn match_then_en_route() {
        let (mut dispatcher, trip_id) = open();

        let actions = dispatcher.driver_accepted(trip_id, DRIVER, secs(1)).unwrap();
        let changed = trip_changes(&actions);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].state, TripState::Matched);
        assert_eq!(changed[0].driver, Some(DRIVER));
        assert_eq!(changed[0].version, 1);

        dispatcher.driver_departed(trip_id, secs(2)).unwrap();
        assert_eq!(dispatcher.trip(trip_id).unwrap().state, TripState::DriverEnRoute);
        assert_eq!(dispatcher.trip(trip_id).unwrap().version, 2);
    }

    #[test]
    fn second_driver_is_rejected() {
        let (mut dispatcher, trip_id) = open();
        dispatcher.driver_accepted(trip_id, DRIVER, secs(1)).unwrap();

        let err = dispatcher.driver_accepted(trip_id, UserId::new(10), secs(2)).unwrap_err();
        assert!(err.rejection().is_some());
        assert_eq!(dispatcher.trip(trip_id).unwrap().driver, Some(DRIVER));
    }

    #[test]
    fn search_timeout_cancels_with_no_driver_found() {
        let (mut dispatcher, trip_id) = open();

        assert!(trip_changes(&dispatcher.tick(secs(59))).is_empty());

        let actions = dispatcher.tick(secs(60));
        let changed = trip_changes(&actions);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].state, TripState::Cancelled);
        assert_eq!(changed[0].cancellation_reason, Some(rideflow_proto::CancellationReason::NoDriverFound));
    }

    #[test]
    fn matched_trip_is_not_timed_out() {
        let (mut dispatcher, trip_id) = open();
        dispatcher.driver_accepted(trip_id, DRIVER, secs(10)).unwrap();

        let actions = dispatcher.tick(secs(120));
        assert!(trip_changes(&actions).is_empty());
        assert_eq!(dispatcher.trip(trip_id).unwrap().state, TripState::Matched);
    }

    #[test]
    fn search_timeout_waits_for_link() {
        let (mut dispatcher, trip_id) = open();
        dispatcher.handle(trip_id, TripInput::LinkDown { reason: "reset".into() }, secs(1)).unwrap();

        assert!(trip_changes(&dispatcher.tick(secs(61))).is_empty());
        assert_eq!(dispatcher.trip(trip_id).unwrap().state, TripState::Requested);
    }

    #[test]
    fn closed_trips_are_forgotten() {
        let (mut dispatcher, trip_id) = open();
        let actions = dispatcher.handle(trip_id, TripInput::Shutdown, secs(1)).unwrap();
        assert!(actions.iter().any(|a| a.action == TripAction::StatusChanged(ConnectionStatus::Disconnected)));

        dispatcher.tick(secs(2));
        assert!(dispatcher.is_empty());

        let err = dispatcher.driver_accepted(trip_id, DRIVER, secs(3)).unwrap_err();
        assert_eq!(err, CoordinatorError::Closed { trip_id });
    }
}
