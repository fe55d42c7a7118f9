//! Simulation callbacks: typed producer inputs in, typed outputs out.
//!
//! A [`SimCallback`] runs on the simulation side once per step, before the
//! simulation advances. The producer stages one `Input` per tick through
//! the push snapshot; the callback may answer with one `Output` per step.
//!
//! Push snapshots carry callbacks of many concrete types, so the
//! simulation side only sees the object-safe [`CallbackObject`]. The
//! engine provides the adapter from one to the other.

use std::any::Any;
use std::sync::Arc;

use crate::snapshot::StepInfo;

/// Type-erased callback input as carried by a push snapshot.
///
/// Shared (`Arc`) because every sub-step of one producer tick observes the
/// same input.
pub type CallbackInput = Arc<dyn Any + Send + Sync>;

/// A user callback executed on the simulation side each step.
pub trait SimCallback: Send + 'static {
    /// Data staged by the producer for one tick.
    type Input: Send + Sync + 'static;
    /// Data produced by the callback for one step.
    type Output: Send + 'static;

    /// Called before the simulation advances by `step.dt`.
    ///
    /// `input` is the value staged for the producer tick this step belongs
    /// to, if any was staged.
    fn pre_simulate(&mut self, step: &StepInfo, input: Option<&Self::Input>)
        -> Option<Self::Output>;

    /// Called once when an unregistration request reaches the simulation.
    fn on_removed(&mut self) {}
}

/// Object-safe view of a registered callback.
pub trait CallbackObject: Send {
    /// Run the callback for one step with the erased input, if any.
    fn pre_simulate_erased(&mut self, step: &StepInfo, input: Option<&CallbackInput>);

    /// Forwarded from [`SimCallback::on_removed`].
    fn on_removed(&mut self);
}
