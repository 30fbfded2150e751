//! Invariant checking for deterministic simulation.
//!
//! Invariants are properties that must hold on every run, whatever the seed
//! and whatever the network did. The world extracts each participant's
//! observable state into a [`WorldSnapshot`] after every step and runs the
//! registered [`Invariant`] checks against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let report = world.run(&registry)?;
//! ```

mod checks;
mod snapshot;

pub use checks::{ChatOrder, Convergence, DriverAgreement, ReasonMatchesState, TerminalStability, VersionMonotonicity};
pub use snapshot::{NodeSnapshot, WorldSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against world state.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    ///
    /// Returns `Ok(())` if the invariant holds, or a [`Violation`]
    /// describing what went wrong.
    fn check(&self, state: &WorldSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Create a registry with every standard trip invariant.
    ///
    /// Includes:
    /// - [`VersionMonotonicity`]: one notification per version, never
    ///   backwards
    /// - [`TerminalStability`]: terminal states stay put, except cancel over
    ///   completion
    /// - [`ReasonMatchesState`]: reason present exactly when cancelled
    /// - [`DriverAgreement`]: a single driver
    /// - [`ChatOrder`]: per-sender chat order and agreement
    /// - [`Convergence`]: same terminal state once settled
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(VersionMonotonicity);
        registry.add(TerminalStability);
        registry.add(ReasonMatchesState);
        registry.add(DriverAgreement);
        registry.add(ChatOrder);
        registry.add(Convergence);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants against the given state.
    ///
    /// Returns `Ok(())` if all invariants hold, or all violations found.
    pub fn check_all(&self, state: &WorldSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> = self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    ///
    /// For tests that want immediate failure with context.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &WorldSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
