//! Rideflow trip simulator.
//!
//! # Usage
//!
//! ```bash
//! # One seeded trip on a lossy network
//! rideflow-sim run --scenario passenger-cancels --seed 7 --drop-rate 0.2
//!
//! # Many seeds, every scenario, fail on the first invariant violation
//! rideflow-sim sweep --seeds 500 --drop-rate 0.3
//!
//! # A real-time ride over the in-memory hub with production timings
//! rideflow-sim --profile production live
//! ```

mod live;
mod simulate;

use clap::{Parser, Subcommand};
use rideflow_client::Profile;
use rideflow_harness::ScenarioKind;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Rideflow trip simulator
#[derive(Parser, Debug)]
#[command(name = "rideflow-sim")]
#[command(about = "Simulate Rideflow trips under network faults")]
#[command(version)]
struct Args {
    /// Deployment profile supplying timings (development, staging, production)
    #[arg(long, default_value = "development", global = true)]
    profile: Profile,

    /// Log filter; defaults to the profile's level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one seeded trip in virtual time
    Run {
        /// Scenario preset
        #[arg(long, default_value = "complete")]
        scenario: ScenarioKind,

        /// RNG seed
        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[command(flatten)]
        faults: simulate::Faults,
    },

    /// Run a range of seeds and stop at the first failure
    Sweep {
        /// Scenario preset; every preset when omitted
        #[arg(long)]
        scenario: Option<ScenarioKind>,

        /// Number of seeds per scenario
        #[arg(long, default_value_t = 100)]
        seeds: u64,

        /// First seed of the range
        #[arg(long, default_value_t = 0)]
        first_seed: u64,

        #[command(flatten)]
        faults: simulate::Faults,
    },

    /// Drive one ride in real time over the in-memory hub
    Live,
}

/// Failures that end the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
enum SimError {
    /// An invariant broke during a seeded run
    #[error("seed {seed}: {violations}")]
    Violation {
        /// Seed that reproduces the failure
        seed: u64,
        /// Violated invariants, joined
        violations: String,
    },

    /// A seeded run hit its deadline before every participant closed
    #[error("seed {seed}: not settled after {elapsed:?}")]
    Unsettled {
        /// Seed that reproduces the failure
        seed: u64,
        /// Virtual time simulated
        elapsed: std::time::Duration,
    },

    /// The live ride was refused an action
    #[error("live ride: {0}")]
    Submit(#[from] rideflow_client::SubmitError),

    /// The live ride did not progress in time
    #[error("live ride: timed out waiting for {0}")]
    Timeout(&'static str),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = args.log_level.as_deref().unwrap_or(args.profile.log_level());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(profile = %args.profile, "Rideflow simulator starting");

    match args.command {
        Command::Run { scenario, seed, faults } => {
            simulate::run_one(args.profile, scenario, seed, &faults)?;
        },
        Command::Sweep { scenario, seeds, first_seed, faults } => {
            let kinds = scenario.map_or_else(|| ScenarioKind::ALL.to_vec(), |kind| vec![kind]);
            simulate::sweep(args.profile, &kinds, first_seed..first_seed.saturating_add(seeds), &faults)?;
        },
        Command::Live => live::run(args.profile).await?,
    }

    Ok(())
}
