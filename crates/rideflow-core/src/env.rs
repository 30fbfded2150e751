//! Environment abstraction for deterministic testing.
//!
//! Decouples trip logic from system resources (time, randomness). The async
//! runtime plugs in real time and OS entropy; the simulation harness plugs in
//! a virtual clock and a seeded RNG.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - Given the same seed, a simulated environment yields the same random
///   sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; simulation uses a virtual
    /// instant driven by the harness.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code calls this. State machines take `now` as a parameter.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`. Used to mint trip identifiers.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Time arithmetic the state machines need on top of `Sub`.
///
/// Deadlines are stored as `(start, window)` pairs and compared with
/// subtraction, so instant types never need `Add<Duration>`.
pub(crate) fn elapsed_at_least<I>(now: I, since: I, window: Duration) -> bool
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    now >= since && now - since >= window
}
