//! Finished-trip history.

use std::collections::VecDeque;

use rideflow_proto::{CancellationReason, Trip, TripId, TripState, UserId};

/// Maximum number of finished trips kept.
pub const MAX_HISTORY: usize = 50;

/// Summary of a finished trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripRecord {
    /// Trip identifier
    pub trip_id: TripId,
    /// The rider
    pub passenger: UserId,
    /// The driver, if one was matched
    pub driver: Option<UserId>,
    /// `Completed` or `Cancelled`
    pub outcome: TripState,
    /// Why the trip was cancelled
    pub cancellation_reason: Option<CancellationReason>,
    /// Final version
    pub version: u64,
}

impl TripRecord {
    /// Summarize a terminal trip. `None` while the trip is still running.
    pub fn from_trip(trip: &Trip) -> Option<Self> {
        trip.is_terminal().then(|| Self {
            trip_id: trip.id,
            passenger: trip.passenger,
            driver: trip.driver,
            outcome: trip.state,
            cancellation_reason: trip.cancellation_reason,
            version: trip.version,
        })
    }
}

/// Most recent finished trips first, bounded to [`MAX_HISTORY`].
#[derive(Debug, Clone, Default)]
pub struct TripHistory {
    records: VecDeque<TripRecord>,
}

impl TripHistory {
    /// Record a finished trip.
    ///
    /// A trip already present is updated in place, which happens when a
    /// racing cancel overturns a completion.
    pub fn record(&mut self, trip: &Trip) {
        let Some(record) = TripRecord::from_trip(trip) else {
            return;
        };

        if let Some(existing) = self.records.iter_mut().find(|r| r.trip_id == record.trip_id) {
            *existing = record;
            return;
        }

        self.records.push_front(record);
        self.records.truncate(MAX_HISTORY);
    }

    /// Records, most recent first.
    pub fn records(&self) -> Vec<TripRecord> {
        self.records.iter().cloned().collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: u128, state: TripState) -> Trip {
        let mut trip = Trip::requested(TripId::new(id), UserId::new(1));
        trip.state = state;
        trip.version = 5;
        if state == TripState::Cancelled {
            trip.cancellation_reason = Some(CancellationReason::PassengerCancelled);
        }
        trip
    }

    #[test]
    fn ignores_running_trips() {
        let mut history = TripHistory::default();
        history.record(&finished(1, TripState::InProgress));
        assert!(history.is_empty());
    }

    #[test]
    fn most_recent_first_and_bounded() {
        let mut history = TripHistory::default();
        for id in 0..60 {
            history.record(&finished(id, TripState::Completed));
        }

        let records = history.records();
        assert_eq!(records.len(), MAX_HISTORY);
        assert_eq!(records[0].trip_id, TripId::new(59));
        assert_eq!(records[MAX_HISTORY - 1].trip_id, TripId::new(10));
    }

    #[test]
    fn overturned_completion_updates_in_place() {
        let mut history = TripHistory::default();
        history.record(&finished(1, TripState::Completed));
        history.record(&finished(2, TripState::Completed));
        history.record(&finished(1, TripState::Cancelled));

        let records = history.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, TripState::Cancelled);
        assert_eq!(records[1].cancellation_reason, Some(CancellationReason::PassengerCancelled));
    }
}
