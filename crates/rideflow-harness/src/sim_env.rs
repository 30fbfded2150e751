//! Simulated environment: virtual time and seeded randomness.
//!
//! Clones share one clock and one RNG, so every component of a simulated
//! world observes the same timeline and the same random sequence. Time moves
//! only when the harness advances it.

use std::{
    ops::Sub,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rideflow_core::Environment;

/// Point on the simulated timeline, measured from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    pub(crate) fn at(since_start: Duration) -> Self {
        Self(since_start)
    }

    /// Time since the simulation started.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    /// Saturates at zero instead of panicking on a reversed pair.
    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

#[derive(Debug)]
struct SimState {
    now: Duration,
    rng: ChaCha8Rng,
}

/// Deterministic environment for simulation.
#[derive(Debug, Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
    seed: u64,
}

impl SimEnv {
    /// Create an environment at time zero with a seeded RNG.
    pub fn with_seed(seed: u64) -> Self {
        let state = SimState { now: Duration::ZERO, rng: ChaCha8Rng::seed_from_u64(seed) };
        Self { state: Arc::new(Mutex::new(state)), seed }
    }

    /// Seed this environment was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now = state.now.saturating_add(by);
    }

    /// `true` with probability `p` (clamped to 0.0..=1.0).
    pub fn chance(&self, p: f64) -> bool {
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        self.lock().rng.gen_bool(p)
    }

    /// Uniform duration in `min..=max`.
    pub fn between(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        self.lock().rng.gen_range(min..=max)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.lock().now)
    }

    /// Advances the virtual clock and completes immediately.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_moves_only_when_advanced() {
        let env = SimEnv::with_seed(1);
        let start = env.now();
        assert_eq!(env.now(), start);

        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(start - env.now(), Duration::ZERO);
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::with_seed(1);
        let other = env.clone();
        other.advance(Duration::from_secs(3));
        assert_eq!(env.now().since_start(), Duration::from_secs(3));
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        let c = SimEnv::with_seed(43);

        let draw = |env: &SimEnv| (0..8).map(|_| env.random_u64()).collect::<Vec<_>>();
        assert_eq!(draw(&a), draw(&b));
        assert_ne!(draw(&a), draw(&c));
    }

    #[test]
    fn between_stays_in_range() {
        let env = SimEnv::with_seed(7);
        let (min, max) = (Duration::from_millis(5), Duration::from_millis(50));
        for _ in 0..100 {
            let d = env.between(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(env.between(max, min), max);
    }
}
