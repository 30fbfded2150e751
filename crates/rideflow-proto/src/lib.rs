//! Rideflow wire protocol.
//!
//! Everything passenger, driver, and dispatcher must agree on bit-for-bit:
//! identifiers, the trip and chat data model, the fixed frame header, and the
//! CBOR payloads carried behind it.
//!
//! # Frame Layout
//!
//! ```text
//! ┌────────────────────────────┬──────────────────────────┐
//! │ FrameHeader (48 bytes, BE) │ CBOR payload (variable)  │
//! └────────────────────────────┴──────────────────────────┘
//! ```
//!
//! The header carries the routing and ordering fields (`kind`, `trip_id`,
//! `sequence`, `sender_id`) so relays can route and receivers can sequence
//! without decoding the payload. The `sequence` field holds the trip `version`
//! for trip events and the `sequence_number` for chat messages.

#![deny(missing_docs)]

pub mod chat;
pub mod errors;
pub mod frame;
pub mod header;
pub mod ids;
pub mod kind;
pub mod payloads;
pub mod trip;

pub use chat::ChatMessage;
pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use ids::{TripId, UserId};
pub use kind::FrameKind;
pub use payloads::{Ack, Payload, ResyncRequest, ResyncResponse, StreamKind};
pub use trip::{Actor, CancellationReason, Trip, TripEvent, TripState};
