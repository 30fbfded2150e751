//! Seeded unreliable network between trip participants.
//!
//! Every frame is broadcast to the other participants. Each copy is dropped,
//! delayed, or duplicated independently using the shared [`SimEnv`] RNG, so a
//! run is fully determined by its seed. Random latency reorders frames.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

use rideflow_core::Environment;
use rideflow_proto::Frame;

use crate::sim_env::{SimEnv, SimInstant};

/// Participant in a simulated trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    /// Rider app
    Passenger,
    /// Driver app
    Driver,
    /// Dispatch backend
    Dispatcher,
}

impl NodeId {
    /// Every participant.
    pub const ALL: [NodeId; 3] = [NodeId::Passenger, NodeId::Driver, NodeId::Dispatcher];
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeId::Passenger => "passenger",
            NodeId::Driver => "driver",
            NodeId::Dispatcher => "dispatcher",
        };
        f.write_str(name)
    }
}

/// Network fault settings
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Probability that a single copy of a frame is lost
    pub drop_rate: f64,
    /// Probability that a delivered frame arrives twice
    pub duplicate_rate: f64,
    /// Lower bound on one-way latency
    pub min_latency: Duration,
    /// Upper bound on one-way latency
    pub max_latency: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            min_latency: Duration::from_millis(5),
            max_latency: Duration::from_millis(50),
        }
    }
}

impl NetworkConfig {
    /// Perfect network with fixed latency.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Network that loses and duplicates frames at the given rate.
    pub fn lossy(rate: f64) -> Self {
        Self { drop_rate: rate, duplicate_rate: rate, ..Self::default() }
    }
}

/// Frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Copies handed to the network
    pub sent: u64,
    /// Copies that reached a linked participant
    pub delivered: u64,
    /// Copies lost to the drop rate, a partition, or a missing link
    pub dropped: u64,
    /// Extra copies injected
    pub duplicated: u64,
}

/// In-flight frames ordered by delivery time.
#[derive(Debug)]
pub struct SimNetwork {
    config: NetworkConfig,
    env: SimEnv,
    in_flight: BTreeMap<(SimInstant, u64), (NodeId, Frame)>,
    next_seq: u64,
    partitioned: BTreeSet<NodeId>,
    stats: NetworkStats,
}

impl SimNetwork {
    /// Create a network drawing randomness from `env`.
    pub fn new(config: NetworkConfig, env: SimEnv) -> Self {
        Self {
            config,
            env,
            in_flight: BTreeMap::new(),
            next_seq: 0,
            partitioned: BTreeSet::new(),
            stats: NetworkStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Frames not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether `node` is cut off.
    pub fn is_partitioned(&self, node: NodeId) -> bool {
        self.partitioned.contains(&node)
    }

    /// Cut `node` off or reconnect it. Frames already in flight to a cut-off
    /// node are lost when they arrive.
    pub fn set_partitioned(&mut self, node: NodeId, partitioned: bool) {
        if partitioned {
            self.partitioned.insert(node);
        } else {
            self.partitioned.remove(&node);
        }
    }

    /// Broadcast `frame` from `from` to every other participant.
    pub fn broadcast(&mut self, from: NodeId, frame: &Frame) {
        for to in NodeId::ALL {
            if to != from {
                self.send(from, to, frame.clone());
            }
        }
    }

    fn send(&mut self, from: NodeId, to: NodeId, frame: Frame) {
        self.stats.sent += 1;

        if self.is_partitioned(from) || self.is_partitioned(to) || self.env.chance(self.config.drop_rate) {
            self.stats.dropped += 1;
            tracing::trace!(%from, %to, kind = ?frame.header.kind(), "Frame dropped");
            return;
        }

        if self.env.chance(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            self.schedule(to, frame.clone());
        }
        self.schedule(to, frame);
    }

    fn schedule(&mut self, to: NodeId, frame: Frame) {
        let latency = self.env.between(self.config.min_latency, self.config.max_latency);
        let deliver_at = SimInstant::at(self.env.now().since_start() + latency);
        self.in_flight.insert((deliver_at, self.next_seq), (to, frame));
        self.next_seq += 1;
    }

    /// Remove and return every frame due at or before `now`, in delivery
    /// order. Frames addressed to a partitioned node are discarded.
    pub fn deliver_due(&mut self, now: SimInstant) -> Vec<(NodeId, Frame)> {
        let mut due = Vec::new();
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (to, frame) = entry.remove();
            if self.is_partitioned(to) {
                self.stats.dropped += 1;
                continue;
            }
            due.push((to, frame));
        }
        due
    }

    /// A due frame reached its recipient.
    pub fn record_delivered(&mut self) {
        self.stats.delivered += 1;
    }

    /// A due frame found no open link at its recipient.
    pub fn record_lost(&mut self) {
        self.stats.dropped += 1;
    }
}
