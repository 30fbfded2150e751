//! Rideflow trip lifecycle core.
//!
//! Sans-IO state machines that keep a trip consistent across the passenger,
//! driver, and dispatcher replicas. Nothing here touches the network or the
//! clock: every operation takes `now` and returns actions for the caller to
//! execute. The async runtime (`rideflow-client`) and the deterministic
//! simulation (`rideflow-harness`) drive the same code.
//!
//! # Components
//!
//! - [`TripMachine`]: legal transitions, versioning, cancel-wins
//! - [`Sequencer`]: in-order delivery per stream with bounded gap buffering
//! - [`ConfirmationGate`]: latches a driver's swipe so one gesture sends one
//!   transition
//! - [`ChatSession`]: per-trip append-only chat log
//! - [`ChannelManager`]: connection lifecycle, backoff, and the unacked outbox
//! - [`TripCoordinator`]: composes the above for one participant
//! - [`Dispatcher`]: system-role coordinators plus driver search timeouts

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod chat;
pub mod coordinator;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod gate;
pub mod machine;
pub mod sequencer;

pub use channel::{ChannelAction, ChannelConfig, ChannelManager, ConnectionSession, ConnectionStatus};
pub use chat::{ChatReceive, ChatSession};
pub use coordinator::{Alert, CoordinatorConfig, TripAction, TripCoordinator, TripInput};
pub use dispatch::{DispatchAction, DispatchConfig, Dispatcher};
pub use env::Environment;
pub use error::{ChannelError, ChatError, CoordinatorError, GapTimeout, RejectReason, RejectedTransition};
pub use gate::{ConfirmationGate, GateConfig, GatePhase};
pub use machine::TripMachine;
pub use sequencer::{Ingest, Sequenced, Sequencer, SequencerConfig};
