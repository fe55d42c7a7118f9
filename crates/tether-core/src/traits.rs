//! Traits at the seams of the pipeline: pooling, simulation, rewind.

use crate::error::SimulationError;
use crate::id::InternalStep;
use crate::snapshot::{PullSnapshot, PushSnapshot, StepInfo};

/// A value that can live in a snapshot pool.
///
/// `reset()` must return the value to its `Default` meaning while keeping
/// any heap capacity it owns. Pools call it on every free; forgetting a
/// field here leaks stale data into the next tick.
pub trait Poolable: Default + Send + 'static {
    /// Clear all transient contents.
    fn reset(&mut self);
}

/// The opaque "advance the simulation by dt" operation.
///
/// Implementations own all physical state. The pipeline only hands them
/// one push snapshot per step and asks for results afterwards.
///
/// Implementations must be substep-reentrant: for sub-steps after the
/// first, the push snapshot only carries continuous data (forces, torques,
/// callback inputs). One-shot data has already been applied.
pub trait Simulation: Send + 'static {
    /// Apply `push` and advance by `step.dt`.
    fn advance(&mut self, push: &PushSnapshot, step: &StepInfo) -> Result<(), SimulationError>;

    /// Write the state of every object changed by the last advance.
    ///
    /// `out` arrives reset; timing fields are filled in by the caller.
    fn buffer_results(&mut self, out: &mut PullSnapshot);

    /// Restore the state that existed at the start of `step`.
    ///
    /// Returns `false` if the step is not available. The default
    /// implementation does not support rewinding.
    fn rewind_to_step(&mut self, step: InternalStep) -> bool {
        let _ = step;
        false
    }

    /// Discard all state for a new episode. Called by solver reset.
    fn reset(&mut self) {}
}

/// Decides when the simulation should rewind and replay.
///
/// Consulted after every completed, non-replayed step while the solver is
/// not shutting down.
pub trait RewindCallback: Send + 'static {
    /// Return the step to rewind to, or `None` to carry on.
    ///
    /// `last_step` is the step that just completed.
    fn trigger_rewind_if_needed(&mut self, last_step: InternalStep) -> Option<InternalStep>;

    /// Called before each replayed step.
    fn pre_resim_step(&mut self, step: InternalStep, first: bool) {
        let _ = (step, first);
    }

    /// Called after each replayed step.
    fn post_resim_step(&mut self, step: InternalStep) {
        let _ = step;
    }
}
