//! Seeded runs on the simulation harness.

use std::{ops::Range, time::Duration};

use rideflow_client::Profile;
use rideflow_harness::{
    InvariantRegistry, NetworkConfig, RunReport, Scenario, ScenarioKind, TripWorld, WorldConfig,
};

use crate::SimError;

/// Network fault flags
#[derive(clap::Args, Debug, Clone)]
pub struct Faults {
    /// Probability that a frame copy is lost
    #[arg(long, default_value_t = 0.0)]
    pub drop_rate: f64,

    /// Probability that a frame arrives twice; defaults to the drop rate
    #[arg(long)]
    pub duplicate_rate: Option<f64>,

    /// Lower bound on one-way latency in milliseconds
    #[arg(long, default_value_t = 5)]
    pub min_latency_ms: u64,

    /// Upper bound on one-way latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub max_latency_ms: u64,
}

impl Faults {
    fn network(&self) -> NetworkConfig {
        NetworkConfig {
            drop_rate: self.drop_rate,
            duplicate_rate: self.duplicate_rate.unwrap_or(self.drop_rate),
            min_latency: Duration::from_millis(self.min_latency_ms),
            max_latency: Duration::from_millis(self.max_latency_ms.max(self.min_latency_ms)),
        }
    }
}

/// World settings: the profile's timings with the harness's linger window,
/// so peers that were cut off still get to catch up.
fn world_config(profile: Profile, seed: u64, faults: &Faults) -> WorldConfig {
    let defaults = WorldConfig::default();
    let mut coordinator = profile.config().coordinator;
    coordinator.linger = defaults.coordinator.linger;

    WorldConfig { seed, network: faults.network(), coordinator, ..defaults }
}

fn run(profile: Profile, kind: ScenarioKind, seed: u64, faults: &Faults) -> Result<RunReport, SimError> {
    let mut world = TripWorld::new(world_config(profile, seed, faults), Scenario::new(kind));
    let report = world.run(&InvariantRegistry::standard()).map_err(|violations| {
        let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
        SimError::Violation { seed, violations: messages.join("; ") }
    })?;

    if !report.settled {
        return Err(SimError::Unsettled { seed, elapsed: report.elapsed });
    }
    Ok(report)
}

/// Run one trip and log how each participant saw it end.
pub fn run_one(profile: Profile, kind: ScenarioKind, seed: u64, faults: &Faults) -> Result<(), SimError> {
    let report = run(profile, kind, seed, faults)?;

    for (node, trip) in &report.trips {
        tracing::info!(
            %node,
            state = %trip.state,
            version = trip.version,
            reason = ?trip.cancellation_reason,
            notifications = report.notifications.get(node).copied().unwrap_or_default(),
            alerts = report.alerts.get(node).map_or(0, Vec::len),
            "Final view"
        );
    }
    tracing::info!(
        scenario = %kind,
        seed,
        elapsed = ?report.elapsed,
        sent = report.network.sent,
        delivered = report.network.delivered,
        dropped = report.network.dropped,
        duplicated = report.network.duplicated,
        "Trip settled"
    );
    Ok(())
}

/// Run every seed in `seeds` for each scenario, stopping at the first
/// failure.
pub fn sweep(profile: Profile, kinds: &[ScenarioKind], seeds: Range<u64>, faults: &Faults) -> Result<(), SimError> {
    for &kind in kinds {
        let mut slowest = Duration::ZERO;
        for seed in seeds.clone() {
            let report = run(profile, kind, seed, faults)?;
            slowest = slowest.max(report.elapsed);
        }
        tracing::info!(scenario = %kind, runs = seeds.end - seeds.start, slowest = ?slowest, "Scenario passed");
    }
    Ok(())
}
