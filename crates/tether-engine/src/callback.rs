//! Typed callback registration on top of the erased [`CallbackObject`].
//!
//! The producer registers a [`SimCallback`] and keeps a [`CallbackHandle`].
//! The callback itself travels to the simulation side inside a push
//! snapshot, wrapped in a [`CallbackSlot`] that downcasts inputs and sends
//! outputs back over a dedicated single-producer/single-consumer channel.

use std::marker::PhantomData;

use crossbeam_channel::{Receiver, Sender};
use tether_core::{
    CallbackId, CallbackInput, CallbackObject, ExternalTimestamp, InternalStep, SimCallback,
    StepInfo,
};

/// One output produced by a callback during one step.
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackOutput<T> {
    /// Step that produced the output.
    pub internal_step: InternalStep,
    /// Producer tick the step belonged to.
    pub external_timestamp: ExternalTimestamp,
    /// Whether the step was a replay.
    pub resim: bool,
    /// The callback's output.
    pub value: T,
}

/// Simulation-side adapter from a typed callback to [`CallbackObject`].
pub(crate) struct CallbackSlot<C: SimCallback> {
    id: CallbackId,
    callback: C,
    outputs: Sender<CallbackOutput<C::Output>>,
}

impl<C: SimCallback> CallbackSlot<C> {
    pub(crate) fn new(id: CallbackId, callback: C, outputs: Sender<CallbackOutput<C::Output>>) -> Self {
        Self {
            id,
            callback,
            outputs,
        }
    }
}

impl<C: SimCallback> CallbackObject for CallbackSlot<C> {
    fn pre_simulate_erased(&mut self, step: &StepInfo, input: Option<&CallbackInput>) {
        let typed = match input {
            Some(erased) => {
                let typed = erased.downcast_ref::<C::Input>();
                if typed.is_none() {
                    tracing::warn!(callback = self.id.0, "callback input has unexpected type");
                }
                typed
            }
            None => None,
        };
        if let Some(value) = self.callback.pre_simulate(step, typed) {
            // Receiver dropped: nobody is listening any more.
            let _ = self.outputs.send(CallbackOutput {
                internal_step: step.internal_step,
                external_timestamp: step.external_timestamp,
                resim: step.resim,
                value,
            });
        }
    }

    fn on_removed(&mut self) {
        self.callback.on_removed();
    }
}

/// Producer-side handle to a registered callback.
///
/// Used to stage inputs, to unregister, and to receive outputs.
pub struct CallbackHandle<C: SimCallback> {
    id: CallbackId,
    outputs: Receiver<CallbackOutput<C::Output>>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: SimCallback> CallbackHandle<C> {
    pub(crate) fn new(id: CallbackId, outputs: Receiver<CallbackOutput<C::Output>>) -> Self {
        Self {
            id,
            outputs,
            _marker: PhantomData,
        }
    }

    /// The callback's id.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Next output, if one has been produced.
    pub fn try_recv(&self) -> Option<CallbackOutput<C::Output>> {
        self.outputs.try_recv().ok()
    }

    /// All outputs produced so far, oldest first.
    pub fn drain(&self) -> Vec<CallbackOutput<C::Output>> {
        self.outputs.try_iter().collect()
    }
}

impl<C: SimCallback> std::fmt::Debug for CallbackHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("pending_outputs", &self.outputs.len())
            .finish()
    }
}
