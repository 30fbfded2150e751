//! Connection lifecycle per trip.
//!
//! The channel manager owns one logical connection per active trip. It is a
//! pure state machine: methods take time as input and return
//! [`ChannelAction`]s for the driver to execute (open a link, close it,
//! transmit a frame). The driver reports link events back with
//! [`ChannelManager::link_up`] and [`ChannelManager::link_down`].
//!
//! # Connection States
//!
//! ```text
//!               connect             link_up
//! Disconnected ────────> Connecting ───────> Connected
//!       ^                    │                 │   ^
//!       │ disconnect         │ link_down       │   │ link_up
//!       │                    ↓                 ↓   │
//!       └──────────────── Reconnecting <───────────┘
//!                          (backoff)
//! ```
//!
//! Sequenced frames (trip events and chat messages) stay in an unacked outbox
//! until every peer on the trip acknowledges them. They are resent after a
//! reconnect and periodically while the link is up. Nothing else is replayed;
//! lost history is the sequencer's problem.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    ops::Sub,
    time::Duration,
};

use rideflow_proto::{Ack, Frame, StreamKind, TripId, UserId};

use crate::{env::elapsed_at_least, error::ChannelError};

/// Delay before the first reconnect attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the delay between reconnect attempts.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Growth factor between consecutive reconnect delays.
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// How long unacked frames wait before being sent again on a live link.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(3);

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Delay before the first reconnect attempt
    pub backoff_base: Duration,
    /// Multiplier applied per failed attempt
    pub backoff_factor: u32,
    /// Maximum delay between attempts
    pub backoff_cap: Duration,
    /// Resend unacked frames this often while connected
    pub retransmit_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
        }
    }
}

impl ChannelConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `base * factor^(attempt - 1)`, capped. With the defaults:
    /// 1, 2, 4, 8, 16, 30, 30, ... seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.backoff_factor.checked_pow(exponent).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(multiplier).min(self.backoff_cap)
    }
}

/// Connection status, as shown in "reconnecting" banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// First link attempt in flight
    Connecting,
    /// Link is up; sends are accepted
    Connected,
    /// No connection and no retries scheduled
    Disconnected,
    /// Link dropped; retrying with backoff
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Observable connection state for one trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    /// Trip the connection serves
    pub trip_id: TripId,
    /// Current status
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last successful link
    pub retry_count: u32,
    /// Reason for the most recent drop
    pub last_error: Option<String>,
}

/// Actions returned by the channel manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Open a transport link for the trip
    OpenLink {
        /// Trip to connect
        trip_id: TripId,
        /// Attempt number, 0 for the initial connect
        attempt: u32,
    },
    /// Close the transport link for the trip
    CloseLink {
        /// Trip to disconnect
        trip_id: TripId,
    },
    /// Write this frame to the trip's link
    Transmit {
        /// Trip whose link carries the frame
        trip_id: TripId,
        /// Frame to write
        frame: Frame,
    },
    /// Session status changed
    StatusChanged {
        /// Trip whose status changed
        trip_id: TripId,
        /// New status
        status: ConnectionStatus,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    frame: Frame,
    acked_by: BTreeSet<UserId>,
}

impl Pending {
    /// Acknowledged by someone, and by every current peer.
    ///
    /// With no peers known yet a frame still needs one acknowledgement.
    fn is_settled(&self, peers: &BTreeSet<UserId>) -> bool {
        !self.acked_by.is_empty() && peers.is_subset(&self.acked_by)
    }
}

#[derive(Debug, Clone)]
struct Slot<I> {
    session: ConnectionSession,
    /// `(dropped_at, delay)` of the pending reconnect attempt
    retry: Option<(I, Duration)>,
    /// Participants that must acknowledge a frame before it leaves the outbox
    peers: BTreeSet<UserId>,
    unacked: HashMap<StreamKind, BTreeMap<u64, Pending>>,
    /// When the outbox was last flushed to the link
    flushed_at: Option<I>,
}

impl<I> Slot<I> {
    fn unacked_len(&self) -> usize {
        self.unacked.values().map(BTreeMap::len).sum()
    }

    /// Every unacked frame, trip events first, each stream in order.
    fn outbox(&self, trip_id: TripId) -> Vec<ChannelAction> {
        let mut streams: Vec<_> = self.unacked.iter().collect();
        streams.sort_by_key(|(stream, _)| stream_order(**stream));
        streams
            .into_iter()
            .flat_map(|(_, frames)| frames.values())
            .map(|pending| ChannelAction::Transmit { trip_id, frame: pending.frame.clone() })
            .collect()
    }
}

/// Per-trip connection manager.
#[derive(Debug, Clone)]
pub struct ChannelManager<I> {
    slots: HashMap<TripId, Slot<I>>,
    config: ChannelConfig,
}

impl<I> ChannelManager<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a manager with no connections.
    pub fn new(config: ChannelConfig) -> Self {
        Self { slots: HashMap::new(), config }
    }

    /// Status of the trip's connection. `Disconnected` if unknown.
    pub fn status(&self, trip_id: TripId) -> ConnectionStatus {
        self.slots.get(&trip_id).map_or(ConnectionStatus::Disconnected, |s| s.session.status)
    }

    /// Session for the trip, if one exists.
    pub fn session(&self, trip_id: TripId) -> Option<&ConnectionSession> {
        self.slots.get(&trip_id).map(|s| &s.session)
    }

    /// Number of sequenced frames awaiting acknowledgement.
    pub fn unacked_len(&self, trip_id: TripId) -> usize {
        self.slots.get(&trip_id).map_or(0, Slot::unacked_len)
    }

    /// Open the trip's connection. No-op if a session already exists.
    pub fn connect(&mut self, trip_id: TripId) -> Vec<ChannelAction> {
        if self.slots.contains_key(&trip_id) {
            return Vec::new();
        }

        tracing::debug!(trip_id = %trip_id, "Connecting");

        self.slots.insert(
            trip_id,
            Slot {
                session: ConnectionSession {
                    trip_id,
                    status: ConnectionStatus::Connecting,
                    retry_count: 0,
                    last_error: None,
                },
                retry: None,
                peers: BTreeSet::new(),
                unacked: HashMap::new(),
                flushed_at: None,
            },
        );

        vec![
            ChannelAction::StatusChanged { trip_id, status: ConnectionStatus::Connecting },
            ChannelAction::OpenLink { trip_id, attempt: 0 },
        ]
    }

    /// Set who must acknowledge sequenced frames on this trip.
    ///
    /// Frames already acknowledged by every listed peer leave the outbox.
    pub fn set_peers(&mut self, trip_id: TripId, peers: impl IntoIterator<Item = UserId>) {
        let Some(slot) = self.slots.get_mut(&trip_id) else {
            return;
        };
        slot.peers = peers.into_iter().collect();
        let peers = slot.peers.clone();
        for frames in slot.unacked.values_mut() {
            frames.retain(|_, pending| !pending.is_settled(&peers));
        }
        slot.unacked.retain(|_, frames| !frames.is_empty());
    }

    /// The driver's link for the trip came up.
    ///
    /// Resets the retry counter and resends every unacked frame in stream
    /// order.
    pub fn link_up(&mut self, trip_id: TripId, now: I) -> Vec<ChannelAction> {
        let Some(slot) = self.slots.get_mut(&trip_id) else {
            return Vec::new();
        };
        if slot.session.status == ConnectionStatus::Connected {
            return Vec::new();
        }

        let retries = slot.session.retry_count;
        slot.session.status = ConnectionStatus::Connected;
        slot.session.retry_count = 0;
        slot.retry = None;

        let resend = slot.outbox(trip_id);
        slot.flushed_at = (!resend.is_empty()).then_some(now);

        tracing::info!(trip_id = %trip_id, retries, resent = resend.len(), "Connected");

        let mut actions =
            vec![ChannelAction::StatusChanged { trip_id, status: ConnectionStatus::Connected }];
        actions.extend(resend);
        actions
    }

    /// The driver's link for the trip failed or dropped.
    ///
    /// Schedules a reconnect with capped exponential backoff. Retries never
    /// give up on their own; only [`ChannelManager::disconnect`] stops them.
    pub fn link_down(&mut self, trip_id: TripId, reason: &str, now: I) -> Vec<ChannelAction> {
        let Some(slot) = self.slots.get_mut(&trip_id) else {
            return Vec::new();
        };
        if slot.retry.is_some() {
            return Vec::new();
        }

        slot.session.retry_count += 1;
        slot.session.last_error = Some(reason.to_string());
        let delay = self.config.backoff(slot.session.retry_count);
        slot.retry = Some((now, delay));

        tracing::warn!(
            trip_id = %trip_id,
            attempt = slot.session.retry_count,
            delay = ?delay,
            reason,
            "Link down, reconnecting"
        );

        if slot.session.status == ConnectionStatus::Reconnecting {
            return Vec::new();
        }
        slot.session.status = ConnectionStatus::Reconnecting;
        vec![ChannelAction::StatusChanged { trip_id, status: ConnectionStatus::Reconnecting }]
    }

    /// Fire reconnect attempts whose backoff elapsed and retransmit stale
    /// unacked frames on live links.
    pub fn tick(&mut self, now: I) -> Vec<ChannelAction> {
        let retransmit_interval = self.config.retransmit_interval;
        let mut actions = Vec::new();

        for (trip_id, slot) in &mut self.slots {
            if let Some((since, delay)) = slot.retry {
                if elapsed_at_least(now, since, delay) {
                    slot.retry = None;
                    actions.push(ChannelAction::OpenLink {
                        trip_id: *trip_id,
                        attempt: slot.session.retry_count,
                    });
                }
                continue;
            }

            if slot.session.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(flushed) = slot.flushed_at else {
                continue;
            };
            if elapsed_at_least(now, flushed, retransmit_interval) {
                let resend = slot.outbox(*trip_id);
                tracing::debug!(trip_id = %trip_id, frames = resend.len(), "Retransmitting");
                slot.flushed_at = Some(now);
                actions.extend(resend);
            }
        }

        actions
    }

    /// Send a frame on the trip's connection.
    ///
    /// Frames on a sequenced `stream` are kept until every peer acknowledges
    /// them.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotConnected` unless the status is `Connected`. The
    ///   frame is not queued.
    pub fn send(
        &mut self,
        trip_id: TripId,
        stream: Option<StreamKind>,
        frame: Frame,
        now: I,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        let Some(slot) = self.slots.get_mut(&trip_id) else {
            return Err(ChannelError::NotConnected { trip_id });
        };
        if slot.session.status != ConnectionStatus::Connected {
            return Err(ChannelError::NotConnected { trip_id });
        }

        if let Some(stream) = stream {
            let pending = Pending { frame: frame.clone(), acked_by: BTreeSet::new() };
            slot.unacked.entry(stream).or_default().insert(frame.header.sequence(), pending);
            slot.flushed_at.get_or_insert(now);
        }

        Ok(vec![ChannelAction::Transmit { trip_id, frame }])
    }

    /// Record that `from` holds everything up to `ack.up_to` on the stream.
    pub fn ack(&mut self, trip_id: TripId, from: UserId, ack: &Ack) {
        let Some(slot) = self.slots.get_mut(&trip_id) else {
            return;
        };
        let Some(frames) = slot.unacked.get_mut(&ack.stream) else {
            return;
        };

        for pending in frames.range_mut(..=ack.up_to).map(|(_, p)| p) {
            pending.acked_by.insert(from);
        }
        let peers = slot.peers.clone();
        frames.retain(|_, pending| !pending.is_settled(&peers));

        if frames.is_empty() {
            slot.unacked.remove(&ack.stream);
        }
        if slot.unacked.is_empty() {
            slot.flushed_at = None;
        }
    }

    /// Close the trip's connection, cancel retries, and drop the outbox.
    pub fn disconnect(&mut self, trip_id: TripId) -> Vec<ChannelAction> {
        let Some(slot) = self.slots.remove(&trip_id) else {
            return Vec::new();
        };

        tracing::info!(
            trip_id = %trip_id,
            dropped = slot.unacked_len(),
            "Disconnected"
        );

        vec![
            ChannelAction::CloseLink { trip_id },
            ChannelAction::StatusChanged { trip_id, status: ConnectionStatus::Disconnected },
        ]
    }
}

/// Trip events before chat, chat by sender.
fn stream_order(stream: StreamKind) -> (u8, u64) {
    match stream {
        StreamKind::Trip => (0, 0),
        StreamKind::Chat { sender } => (1, sender.get()),
    }
}
