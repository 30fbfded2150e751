//! Rideflow trip runtime.
//!
//! Drives [`rideflow_core`]'s sans-IO coordinators with real time and real
//! links. Each trip runs in its own Tokio task; UIs interact through a
//! [`TripHandle`] that exposes subscriptions, the action entry point, and
//! gesture and chat input.
//!
//! # Components
//!
//! - [`RideClient`]: opens trips for one participant and keeps their history
//! - [`TripHandle`]: per-trip UI surface
//! - [`Connector`]: transport seam; [`TripHub`] is the in-memory relay
//! - [`SystemEnv`]: production environment (system time, OS RNG)
//! - [`ClientConfig`] and [`Profile`]: runtime configuration presets

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod history;
mod runtime;
mod system_env;
pub mod transport;

pub use config::{ClientConfig, DEFAULT_TICK_INTERVAL, Profile};
pub use error::{ConfigError, SubmitError, TransportError};
pub use history::{MAX_HISTORY, TripHistory, TripRecord};
pub use rideflow_core::{Alert, ConnectionStatus, Environment, GatePhase};
pub use runtime::{RideClient, TripHandle};
pub use system_env::SystemEnv;
pub use transport::{Connector, Link, TripHub};
