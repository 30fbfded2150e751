//! Transport seam.
//!
//! A [`Link`] is a pair of bounded frame queues to one trip's real-time
//! channel. The runtime obtains links from a [`Connector`] and treats a
//! closed queue as a dropped connection. Protocol logic stays in the
//! coordinator; a link only moves frames.
//!
//! [`TripHub`] is the in-memory connector used by tests and the simulator.
//! It relays every frame to the trip's other members and can sever links or
//! take users offline to exercise reconnection.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rideflow_proto::{Frame, TripId, UserId};
use tokio::{sync::mpsc, task::AbortHandle};

use crate::error::TransportError;

/// Frame queues to one trip's channel.
#[derive(Debug)]
pub struct Link {
    /// Frames to the channel
    pub outbound: mpsc::Sender<Frame>,
    /// Frames from the channel. Yields `None` once the link is gone.
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens links to trip channels.
pub trait Connector: Clone + Send + Sync + 'static {
    /// Connect `user` to the channel of `trip_id`.
    fn connect(
        &self,
        trip_id: TripId,
        user: UserId,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

#[derive(Debug)]
struct Member {
    to_client: mpsc::Sender<Frame>,
    relay: AbortHandle,
}

#[derive(Debug, Default)]
struct HubState {
    trips: BTreeMap<TripId, BTreeMap<UserId, Member>>,
    offline: BTreeSet<UserId>,
}

/// In-memory relay connecting every member of a trip.
///
/// Relaying never blocks: a frame for a member whose queue is full is
/// dropped, like a lossy network would.
#[derive(Debug, Clone)]
pub struct TripHub {
    state: Arc<Mutex<HubState>>,
    capacity: usize,
}

impl TripHub {
    /// Create a hub whose link queues hold `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self { state: Arc::default(), capacity: capacity.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Users currently connected to the trip.
    pub fn members(&self, trip_id: TripId) -> Vec<UserId> {
        self.lock().trips.get(&trip_id).map(|m| m.keys().copied().collect()).unwrap_or_default()
    }

    /// Drop `user`'s link to the trip. Their runtime sees the link close.
    pub fn sever(&self, trip_id: TripId, user: UserId) {
        let mut state = self.lock();
        let Some(members) = state.trips.get_mut(&trip_id) else {
            return;
        };
        if let Some(member) = members.remove(&user) {
            member.relay.abort();
            tracing::debug!(trip_id = %trip_id, user = %user, "Hub severed link");
        }
    }

    /// Take `user` off the network, severing every link, or bring them back.
    /// Connects fail while offline.
    pub fn set_offline(&self, user: UserId, offline: bool) {
        let mut state = self.lock();
        if !offline {
            state.offline.remove(&user);
            return;
        }

        state.offline.insert(user);
        for members in state.trips.values_mut() {
            if let Some(member) = members.remove(&user) {
                member.relay.abort();
            }
        }
        tracing::debug!(user = %user, "Hub took user offline");
    }

    fn peers(&self, trip_id: TripId, sender: UserId) -> Vec<(UserId, mpsc::Sender<Frame>)> {
        self.lock()
            .trips
            .get(&trip_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(user, _)| **user != sender)
                    .map(|(user, member)| (*user, member.to_client.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn relay(self, trip_id: TripId, sender: UserId, mut from_client: mpsc::Receiver<Frame>) {
        while let Some(frame) = from_client.recv().await {
            for (user, to_peer) in self.peers(trip_id, sender) {
                if to_peer.try_send(frame.clone()).is_err() {
                    tracing::debug!(trip_id = %trip_id, from = %sender, to = %user, "Hub dropped frame");
                }
            }
        }
    }
}

impl Connector for TripHub {
    async fn connect(&self, trip_id: TripId, user: UserId) -> Result<Link, TransportError> {
        if self.lock().offline.contains(&user) {
            return Err(TransportError::Offline { user });
        }

        let (outbound, from_client) = mpsc::channel(self.capacity);
        let (to_client, inbound) = mpsc::channel(self.capacity);
        let relay = tokio::spawn(self.clone().relay(trip_id, user, from_client)).abort_handle();

        let replaced =
            self.lock().trips.entry(trip_id).or_default().insert(user, Member { to_client, relay });
        if let Some(old) = replaced {
            old.relay.abort();
        }

        tracing::debug!(trip_id = %trip_id, user = %user, "Hub accepted link");
        Ok(Link { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use rideflow_proto::{FrameHeader, FrameKind};

    use super::*;

    const TRIP: TripId = TripId::new(5);

    fn frame(sender: UserId) -> Frame {
        let mut header = FrameHeader::new(FrameKind::Ack);
        header.set_trip_id(TRIP);
        header.set_sender_id(sender);
        Frame::new(header, Vec::<u8>::new())
    }

    #[tokio::test]
    async fn relays_to_other_members_only() {
        let hub = TripHub::new(8);
        let mut a = hub.connect(TRIP, UserId::new(1)).await.unwrap();
        let mut b = hub.connect(TRIP, UserId::new(2)).await.unwrap();

        a.outbound.send(frame(UserId::new(1))).await.unwrap();

        let received = b.inbound.recv().await.unwrap();
        assert_eq!(received.header.sender_id(), UserId::new(1));
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn sever_closes_the_link() {
        let hub = TripHub::new(8);
        let mut a = hub.connect(TRIP, UserId::new(1)).await.unwrap();

        hub.sever(TRIP, UserId::new(1));

        assert!(a.inbound.recv().await.is_none());
        assert!(hub.members(TRIP).is_empty());
    }

    #[tokio::test]
    async fn offline_users_cannot_connect() {
        let hub = TripHub::new(8);
        hub.set_offline(UserId::new(1), true);

        let err = hub.connect(TRIP, UserId::new(1)).await.unwrap_err();
        assert_eq!(err, TransportError::Offline { user: UserId::new(1) });

        hub.set_offline(UserId::new(1), false);
        assert!(hub.connect(TRIP, UserId::new(1)).await.is_ok());
        assert_eq!(hub.members(TRIP), vec![UserId::new(1)]);
    }
}
