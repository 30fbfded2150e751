//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture what each participant has shown its user up to a point
//! in time. Invariants operate on snapshots rather than live coordinators so
//! every check sees one consistent moment.

use rideflow_proto::{ChatMessage, Trip, UserId};

use crate::network::NodeId;

/// Snapshot of every participant in a simulated trip.
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    /// Every participant closed its channel. Checks that only make sense
    /// once the run is over look at this.
    pub settled: bool,
    /// Per-participant snapshots
    pub nodes: Vec<NodeSnapshot>,
}

impl WorldSnapshot {
    /// Create an empty snapshot (no participants).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a snapshot from several participants.
    pub fn from_nodes(nodes: Vec<NodeSnapshot>) -> Self {
        Self { settled: false, nodes }
    }

    /// Mark the run as settled.
    pub fn settled(mut self) -> Self {
        self.settled = true;
        self
    }

    /// Add a participant.
    pub fn add_node(&mut self, node: NodeSnapshot) {
        self.nodes.push(node);
    }
}

/// Snapshot of one participant's observable state.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Which participant
    pub node: NodeId,
    /// User the participant acts as
    pub user: UserId,
    /// Current trip view
    pub trip: Trip,
    /// Every trip change shown to the user, in order
    pub notifications: Vec<Trip>,
    /// Chat log in append order
    pub chat: Vec<ChatMessage>,
    /// Channel torn down
    pub closed: bool,
}

impl NodeSnapshot {
    /// Participant holding `trip` with nothing observed yet.
    pub fn new(node: NodeId, user: UserId, trip: Trip) -> Self {
        Self { node, user, trip, notifications: Vec::new(), chat: Vec::new(), closed: false }
    }

    /// Record a trip change. The change becomes the current view.
    pub fn with_notification(mut self, trip: Trip) -> Self {
        self.record(trip);
        self
    }

    /// Append a chat message.
    pub fn with_chat(mut self, message: ChatMessage) -> Self {
        self.chat.push(message);
        self
    }

    /// Mark the channel closed.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    /// Record a trip change in place.
    pub fn record(&mut self, trip: Trip) {
        self.trip = trip.clone();
        self.notifications.push(trip);
    }
}
