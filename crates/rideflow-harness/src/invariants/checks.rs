//! Standard invariant checks.
//!
//! These capture what must hold for every participant on every run, however
//! the network behaved. [`Convergence`] is the only check that waits for the
//! run to settle.

use std::collections::BTreeMap;

use rideflow_proto::{TripState, UserId};

use super::{Invariant, InvariantResult, Violation, WorldSnapshot};

/// Trip versions shown to a user strictly increase.
///
/// A repeated version means the user was notified twice for one change; a
/// lower one means the view went backwards.
pub struct VersionMonotonicity;

impl Invariant for VersionMonotonicity {
    fn name(&self) -> &'static str {
        "version_monotonicity"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for node in &state.nodes {
            for pair in node.notifications.windows(2) {
                if pair[1].version <= pair[0].version {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{}: version went {} -> {} ({} -> {})",
                            node.node, pair[0].version, pair[1].version, pair[0].state, pair[1].state
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Terminal states are final, except that a cancellation may overturn a
/// completion it raced with.
pub struct TerminalStability;

impl Invariant for TerminalStability {
    fn name(&self) -> &'static str {
        "terminal_stability"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for node in &state.nodes {
            for pair in node.notifications.windows(2) {
                let (from, to) = (pair[0].state, pair[1].state);
                let allowed = match from {
                    TripState::Cancelled => false,
                    TripState::Completed => to == TripState::Cancelled,
                    _ => true,
                };
                if !allowed {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("{}: left terminal state {from} for {to}", node.node),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A cancellation reason is present exactly when the trip is cancelled.
pub struct ReasonMatchesState;

impl Invariant for ReasonMatchesState {
    fn name(&self) -> &'static str {
        "reason_matches_state"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        for node in &state.nodes {
            for trip in node.notifications.iter().chain(std::iter::once(&node.trip)) {
                let cancelled = trip.state == TripState::Cancelled;
                if cancelled != trip.cancellation_reason.is_some() {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{}: v{} is {} with reason {:?}",
                            node.node, trip.version, trip.state, trip.cancellation_reason
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// At most one driver is ever assigned, and everyone who knows the driver
/// agrees on who it is.
pub struct DriverAgreement;

impl Invariant for DriverAgreement {
    fn name(&self) -> &'static str {
        "driver_agreement"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        let mut seen: Option<(UserId, String)> = None;

        for node in &state.nodes {
            let drivers = node.notifications.iter().chain(std::iter::once(&node.trip)).filter_map(|t| t.driver);
            for driver in drivers {
                match &seen {
                    None => seen = Some((driver, node.node.to_string())),
                    Some((first, who)) if *first != driver => {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("{who} saw driver {first}, {} saw driver {driver}", node.node),
                        });
                    },
                    Some(_) => {},
                }
            }
        }
        Ok(())
    }
}

/// Each sender's chat messages appear in order without gaps, and every
/// participant holds the same body for the same message.
pub struct ChatOrder;

impl Invariant for ChatOrder {
    fn name(&self) -> &'static str {
        "chat_order"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        let mut bodies: BTreeMap<(UserId, u64), &str> = BTreeMap::new();

        for node in &state.nodes {
            let mut next: BTreeMap<UserId, u64> = BTreeMap::new();
            for message in &node.chat {
                let expected = next.entry(message.sender).or_insert(1);
                if message.sequence_number != *expected {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{}: message {} from {} arrived, expected {}",
                            node.node, message.sequence_number, message.sender, expected
                        ),
                    });
                }
                *expected += 1;

                let key = (message.sender, message.sequence_number);
                let body = *bodies.entry(key).or_insert(message.body.as_str());
                if body != message.body {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{}: message {} from {} reads {:?}, elsewhere {:?}",
                            node.node, message.sequence_number, message.sender, message.body, body
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Once every participant has closed, all of them ended in the same terminal
/// state.
pub struct Convergence;

impl Invariant for Convergence {
    fn name(&self) -> &'static str {
        "convergence"
    }

    fn check(&self, state: &WorldSnapshot) -> InvariantResult {
        if !state.settled {
            return Ok(());
        }

        let Some(first) = state.nodes.first() else {
            return Ok(());
        };

        for node in &state.nodes {
            if !node.trip.is_terminal() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{}: settled in non-terminal state {}", node.node, node.trip.state),
                });
            }
            if node.trip.state != first.trip.state {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{} ended {}, {} ended {}",
                        first.node, first.trip.state, node.node, node.trip.state
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rideflow_proto::{Actor, CancellationReason, ChatMessage, Trip, TripId};

    use super::*;
    use crate::{invariants::NodeSnapshot, network::NodeId};

    const PASSENGER: UserId = UserId::new(1);
    const DRIVER: UserId = UserId::new(2);

    fn at(state: TripState, version: u64) -> Trip {
        let mut trip = Trip::requested(TripId::new(9), PASSENGER);
        trip.state = state;
        trip.version = version;
        if state == TripState::Cancelled {
            trip.cancellation_reason = Some(CancellationReason::PassengerCancelled);
        }
        trip
    }

    fn node(id: NodeId, notifications: &[Trip]) -> NodeSnapshot {
        notifications
            .iter()
            .cloned()
            .fold(NodeSnapshot::new(id, PASSENGER, at(TripState::Requested, 0)), NodeSnapshot::with_notification)
    }

    fn chat(sender: UserId, sequence_number: u64, body: &str) -> ChatMessage {
        ChatMessage {
            trip_id: TripId::new(9),
            sequence_number,
            sender,
            sender_role: Actor::Driver,
            body: body.to_string(),
            sent_at: 0,
        }
    }

    #[test]
    fn repeated_version_is_a_violation() {
        let snapshot = WorldSnapshot::from_nodes(vec![node(
            NodeId::Passenger,
            &[at(TripState::Matched, 1), at(TripState::Matched, 1)],
        )]);
        assert!(VersionMonotonicity.check(&snapshot).is_err());
    }

    #[test]
    fn cancel_may_overturn_completion() {
        let snapshot = WorldSnapshot::from_nodes(vec![node(
            NodeId::Driver,
            &[at(TripState::Completed, 5), at(TripState::Cancelled, 6)],
        )]);
        assert!(TerminalStability.check(&snapshot).is_ok());

        let reopened = WorldSnapshot::from_nodes(vec![node(
            NodeId::Driver,
            &[at(TripState::Cancelled, 5), at(TripState::InProgress, 6)],
        )]);
        assert!(TerminalStability.check(&reopened).is_err());
    }

    #[test]
    fn cancelled_without_reason_is_a_violation() {
        let mut trip = at(TripState::Cancelled, 2);
        trip.cancellation_reason = None;
        let snapshot = WorldSnapshot::from_nodes(vec![node(NodeId::Dispatcher, &[trip])]);
        assert!(ReasonMatchesState.check(&snapshot).is_err());
    }

    #[test]
    fn two_drivers_is_a_violation() {
        let mut first = at(TripState::Matched, 1);
        first.driver = Some(DRIVER);
        let mut second = at(TripState::Matched, 1);
        second.driver = Some(UserId::new(3));

        let agree = WorldSnapshot::from_nodes(vec![
            node(NodeId::Passenger, &[first.clone()]),
            node(NodeId::Dispatcher, &[first.clone()]),
            node(NodeId::Driver, &[at(TripState::Cancelled, 1)]),
        ]);
        assert!(DriverAgreement.check(&agree).is_ok());

        let disagree =
            WorldSnapshot::from_nodes(vec![node(NodeId::Passenger, &[first]), node(NodeId::Dispatcher, &[second])]);
        assert!(DriverAgreement.check(&disagree).is_err());
    }

    #[test]
    fn chat_gap_is_a_violation() {
        let ordered = node(NodeId::Passenger, &[]).with_chat(chat(DRIVER, 1, "hi")).with_chat(chat(DRIVER, 2, "here"));
        assert!(ChatOrder.check(&WorldSnapshot::from_nodes(vec![ordered])).is_ok());

        let gapped = node(NodeId::Passenger, &[]).with_chat(chat(DRIVER, 2, "here"));
        assert!(ChatOrder.check(&WorldSnapshot::from_nodes(vec![gapped])).is_err());
    }

    #[test]
    fn chat_bodies_must_match_everywhere() {
        let a = node(NodeId::Passenger, &[]).with_chat(chat(DRIVER, 1, "hi"));
        let b = node(NodeId::Dispatcher, &[]).with_chat(chat(DRIVER, 1, "bye"));
        assert!(ChatOrder.check(&WorldSnapshot::from_nodes(vec![a, b])).is_err());
    }

    #[test]
    fn convergence_waits_for_settle() {
        let nodes = vec![
            node(NodeId::Passenger, &[at(TripState::Completed, 5)]).closed(),
            node(NodeId::Driver, &[at(TripState::InProgress, 4)]).closed(),
        ];
        let running = WorldSnapshot::from_nodes(nodes);
        assert!(Convergence.check(&running).is_ok());
        assert!(Convergence.check(&running.settled()).is_err());

        let agreed = WorldSnapshot::from_nodes(vec![
            node(NodeId::Passenger, &[at(TripState::Cancelled, 3)]),
            node(NodeId::Driver, &[at(TripState::Cancelled, 4)]),
        ])
        .settled();
        assert!(Convergence.check(&agreed).is_ok());
    }
}
