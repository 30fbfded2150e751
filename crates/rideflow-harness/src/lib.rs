//! Deterministic simulation harness for Rideflow trips.
//!
//! Runs passenger, driver, and dispatcher coordinators against a seeded,
//! unreliable network on virtual time. The same seed always replays the same
//! run, so a failing case can be reproduced exactly.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks what must hold on every run rather than
//! what a particular scenario should produce. Use
//! [`InvariantRegistry::standard()`] for the full set.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod invariants;
pub mod network;
pub mod scenario;
pub mod sim_env;
pub mod world;

pub use invariants::{
    ChatOrder, Convergence, DriverAgreement, Invariant, InvariantRegistry, InvariantResult, NodeSnapshot,
    ReasonMatchesState, TerminalStability, VersionMonotonicity, Violation, WorldSnapshot,
};
pub use network::{NetworkConfig, NetworkStats, NodeId, SimNetwork};
pub use scenario::{Partition, Scenario, ScenarioKind};
pub use sim_env::{SimEnv, SimInstant};
pub use world::{DRIVER, PASSENGER, RunReport, TripWorld, WorldConfig};
