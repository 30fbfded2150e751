//! Action confirmation gate.
//!
//! Turns a deliberate drag gesture ("swipe to confirm arrival") into exactly
//! one transition request. The gate is an explicit state machine:
//!
//! ```text
//!            start             release >= threshold
//! ┌───────┐ ──────> ┌──────────┐ ──────────────────> ┌────────────┐
//! │ Armed │         │ Tracking │                     │ Submitting │
//! └───────┘ <────── └──────────┘                     └────────────┘
//!     ^   release < threshold                          │        │
//!     │                                         failed │        │ trip reached target
//!     └────────────────────────────────────────────────┘        ↓
//!     ^                                                  ┌───────────┐
//!     └──────────────── next gesture target ─────────────│ Confirmed │
//!                                                        └───────────┘
//! ```
//!
//! While `Submitting`, all gesture input is ignored. That is the latch that
//! prevents double submission.

use rideflow_proto::TripState;

/// Default fraction of the track a gesture must cover before release.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// The transition a driver gesture requests from `state`, if any.
pub fn gesture_target(state: TripState) -> Option<TripState> {
    match state {
        TripState::DriverEnRoute => Some(TripState::DriverArrived),
        TripState::DriverArrived => Some(TripState::InProgress),
        TripState::InProgress => Some(TripState::Completed),
        _ => None,
    }
}

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Progress (0.0 to 1.0) required at release
    pub threshold: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { threshold: DEFAULT_THRESHOLD }
    }
}

/// Gate phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatePhase {
    /// Waiting for a gesture
    Armed,
    /// Gesture in progress
    Tracking {
        /// Transition the gesture would request
        target: TripState,
        /// Furthest progress reached, 0.0 to 1.0
        progress: f32,
    },
    /// Request issued, waiting for the trip to reach `target`
    Submitting {
        /// Requested state
        target: TripState,
    },
    /// Trip reached the requested state
    Confirmed {
        /// State that was confirmed
        target: TripState,
    },
}

/// Confirmation gate for one trip.
#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    phase: GatePhase,
    config: GateConfig,
}

impl ConfirmationGate {
    /// Create an armed gate.
    pub fn new(config: GateConfig) -> Self {
        Self { phase: GatePhase::Armed, config }
    }

    /// Current phase.
    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    /// Whether the gate is latched on an outstanding request.
    pub fn is_latched(&self) -> bool {
        matches!(self.phase, GatePhase::Submitting { .. })
    }

    /// Begin a gesture against the trip's current state.
    ///
    /// Returns `false` (and stays put) when latched, already tracking, or no
    /// gesture exists for `state`.
    pub fn start(&mut self, state: TripState) -> bool {
        let Some(target) = gesture_target(state) else {
            return false;
        };

        match self.phase {
            GatePhase::Armed => {},
            GatePhase::Confirmed { target: confirmed } if confirmed != target => {},
            _ => return false,
        }

        self.phase = GatePhase::Tracking { target, progress: 0.0 };
        true
    }

    /// Record gesture progress. Ignored unless tracking.
    pub fn update(&mut self, progress: f32) {
        if let GatePhase::Tracking { target, progress: furthest } = self.phase {
            let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
            self.phase = GatePhase::Tracking { target, progress: furthest.max(progress) };
        }
    }

    /// End the gesture.
    ///
    /// Returns the state to request if the gesture passed the threshold; the
    /// gate is then latched. Otherwise the gate re-arms and returns `None`.
    pub fn release(&mut self) -> Option<TripState> {
        let GatePhase::Tracking { target, progress } = self.phase else {
            return None;
        };

        if progress >= self.config.threshold {
            self.phase = GatePhase::Submitting { target };
            Some(target)
        } else {
            self.phase = GatePhase::Armed;
            None
        }
    }

    /// Feed the trip's state after every change.
    ///
    /// Unlatches into `Confirmed` once the requested state is reached, or
    /// back to `Armed` if the trip ended elsewhere.
    pub fn observe(&mut self, state: TripState) {
        match self.phase {
            GatePhase::Submitting { target } if state == target => {
                self.phase = GatePhase::Confirmed { target };
            },
            GatePhase::Submitting { .. } | GatePhase::Tracking { .. } if state.is_terminal() => {
                self.phase = GatePhase::Armed;
            },
            _ => {},
        }
    }

    /// The submission failed; re-arm so the user can retry.
    pub fn fail(&mut self) {
        if self.is_latched() {
            self.phase = GatePhase::Armed;
        }
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swipe(gate: &mut ConfirmationGate, state: TripState, progress: f32) -> Option<TripState> {
        gate.start(state);
        gate.update(progress);
        gate.release()
    }

    #[test]
    fn release_before_threshold_requests_nothing() {
        let mut gate = ConfirmationGate::default();

        assert_eq!(swipe(&mut gate, TripState::DriverEnRoute, 0.59), None);
        assert_eq!(gate.phase(), GatePhase::Armed);
    }

    #[test]
    fn progress_is_the_furthest_point_reached() {
        let mut gate = ConfirmationGate::default();
        gate.start(TripState::DriverEnRoute);
        gate.update(0.9);
        gate.update(0.2);

        assert_eq!(gate.release(), Some(TripState::DriverArrived));
    }

    #[test]
    fn two_rapid_completions_request_once() {
        let mut gate = ConfirmationGate::default();

        let requests: Vec<_> = (0..2)
            .filter_map(|_| swipe(&mut gate, TripState::DriverEnRoute, 1.0))
            .collect();

        assert_eq!(requests, vec![TripState::DriverArrived]);
        assert!(gate.is_latched());
    }

    #[test]
    fn failure_rearms() {
        let mut gate = ConfirmationGate::default();
        swipe(&mut gate, TripState::DriverEnRoute, 1.0);

        gate.fail();

        assert_eq!(gate.phase(), GatePhase::Armed);
        assert_eq!(swipe(&mut gate, TripState::DriverEnRoute, 1.0), Some(TripState::DriverArrived));
    }

    #[test]
    fn confirmation_then_next_target() {
        let mut gate = ConfirmationGate::default();
        swipe(&mut gate, TripState::DriverEnRoute, 1.0);

        gate.observe(TripState::DriverArrived);
        assert_eq!(gate.phase(), GatePhase::Confirmed { target: TripState::DriverArrived });

        assert_eq!(swipe(&mut gate, TripState::DriverArrived, 0.8), Some(TripState::InProgress));
    }

    #[test]
    fn no_gesture_outside_driver_states() {
        let mut gate = ConfirmationGate::default();
        for state in [TripState::Requested, TripState::Matched, TripState::Completed, TripState::Cancelled] {
            assert!(!gate.start(state));
        }
    }

    #[test]
    fn cancellation_while_submitting_rearms() {
        let mut gate = ConfirmationGate::default();
        swipe(&mut gate, TripState::InProgress, 1.0);

        gate.observe(TripState::Cancelled);

        assert_eq!(gate.phase(), GatePhase::Armed);
    }
}
