//! Real-time ride over the in-memory hub.
//!
//! Passenger, driver, and dispatcher each run their own [`RideClient`] with
//! the chosen profile, the way the apps and the backend would.

use std::time::Duration;

use rideflow_client::{ConnectionStatus, Profile, RideClient, SystemEnv, TripHandle, TripHub};
use rideflow_core::gate::gesture_target;
use rideflow_proto::{Actor, Trip, TripState, UserId};
use tokio::time::timeout;

use crate::SimError;

const PASSENGER: UserId = UserId::new(1);
const DRIVER: UserId = UserId::new(2);

/// Longest wait for any single step of the ride.
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

type Client = RideClient<SystemEnv, TripHub>;

async fn until_connected(handle: &TripHandle, who: &'static str) -> Result<(), SimError> {
    let mut status = handle.watch_status();
    match timeout(STEP_TIMEOUT, status.wait_for(|s| *s == ConnectionStatus::Connected)).await {
        Ok(Ok(_)) => Ok(()),
        _ => Err(SimError::Timeout(who)),
    }
}

async fn until_state(handle: &TripHandle, state: TripState, who: &'static str) -> Result<Trip, SimError> {
    let mut trip = handle.watch_trip();
    match timeout(STEP_TIMEOUT, trip.wait_for(|t| t.state == state)).await {
        Ok(Ok(trip)) => Ok(trip.clone()),
        _ => Err(SimError::Timeout(who)),
    }
}

/// Log everything the passenger is shown.
fn follow_passenger(handle: &TripHandle) {
    let mut trips = handle.subscribe_trip();
    let mut chat = handle.subscribe_chat();
    let mut alerts = handle.subscribe_alerts();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(trip) = trips.recv() => {
                    tracing::info!(state = %trip.state, version = trip.version, "Passenger notified");
                },
                Ok(message) = chat.recv() => {
                    tracing::info!(from = %message.sender_role, body = %message.body, "Passenger chat");
                },
                Ok(alert) = alerts.recv() => {
                    tracing::warn!(?alert, "Passenger alert");
                },
                else => break,
            }
        }
    });
}

/// Swipe through one confirmation and wait for it to land.
async fn confirm(driver: &TripHandle) -> Result<(), SimError> {
    let Some(target) = gesture_target(driver.trip().state) else {
        return Ok(());
    };

    driver.gesture_start().await?;
    for progress in [0.3, 0.7, 1.0] {
        driver.gesture_move(progress).await?;
    }
    driver.gesture_release().await?;
    until_state(driver, target, "driver confirmation").await?;
    Ok(())
}

/// Run a full ride and log the passenger's history at the end.
pub async fn run(profile: Profile) -> Result<(), SimError> {
    let config = profile.config();
    let hub = TripHub::new(config.link_capacity);
    let client = |user, role| -> Client { RideClient::new(SystemEnv::new(), hub.clone(), user, role, config.clone()) };

    let passenger = client(PASSENGER, Actor::Passenger);
    let driver = client(DRIVER, Actor::Driver);
    let dispatcher = client(UserId::SYSTEM, Actor::System);

    tracing::info!(endpoint = profile.endpoint(), "Live ride starting");

    let p = passenger.request_trip();
    follow_passenger(&p);
    let d = dispatcher.join_trip(p.trip());
    until_connected(&p, "passenger link").await?;
    until_connected(&d, "dispatcher link").await?;

    d.assign_driver(DRIVER).await?;
    until_state(&p, TripState::Matched, "passenger to see the match").await?;

    let r = driver.join_trip(d.trip());
    until_connected(&r, "driver link").await?;

    d.submit_action(Actor::System, TripState::DriverEnRoute).await?;
    until_state(&r, TripState::DriverEnRoute, "driver to set off").await?;

    p.post_chat("I'm at the north entrance").await?;
    r.post_chat("Two minutes away").await?;

    while !r.trip().is_terminal() {
        confirm(&r).await?;
    }
    until_state(&p, TripState::Completed, "passenger to see completion").await?;

    for handle in [&p, &r, &d] {
        handle.shutdown().await;
    }

    for record in passenger.history() {
        tracing::info!(
            trip_id = %record.trip_id,
            outcome = %record.outcome,
            version = record.version,
            "Passenger history"
        );
    }
    Ok(())
}
