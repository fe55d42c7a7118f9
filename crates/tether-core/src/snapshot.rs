//! Push and pull snapshot payloads.
//!
//! A [`PushSnapshot`] carries one producer tick (or one sub-step of it)
//! toward the simulation. A [`PullSnapshot`] carries the results of one
//! completed simulation step back. Both are pooled: they are reset and
//! reused rather than dropped, so `reset()` must clear every transient
//! field while keeping allocations.

use std::fmt;

use glam::{Quat, Vec3};
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::callback::{CallbackInput, CallbackObject};
use crate::id::{CallbackId, ExternalTimestamp, InternalStep, ProxyHandle, SimTimestamp};
use crate::state::{ObjectState, RigidState};
use crate::traits::Poolable;

// ── StepInfo ────────────────────────────────────────────────────

/// Timing of one simulation step, as seen by the simulation and callbacks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepInfo {
    /// Step length in producer time units.
    pub dt: f64,
    /// Index of this step within its producer interval.
    pub step: u32,
    /// Number of steps the producer interval was sliced into.
    pub num_steps: u32,
    /// Global step index.
    pub internal_step: InternalStep,
    /// Producer tick this step belongs to.
    pub external_timestamp: ExternalTimestamp,
    /// Producer time at which this step starts.
    pub start_time: f64,
    /// Whether this step is a replay of an already-simulated step.
    pub resim: bool,
}

impl StepInfo {
    /// Whether this is the first step of its producer interval.
    pub fn is_first_step(&self) -> bool {
        self.step == 0
    }

    /// Whether this is the final step of its producer interval.
    pub fn is_last_step(&self) -> bool {
        self.step + 1 >= self.num_steps
    }
}

// ── BodyDelta ───────────────────────────────────────────────────

/// Producer-authored changes to one object during one tick.
///
/// Property writes (`position`, `rotation`, ...) and impulses are one-shot:
/// they apply on the first sub-step only. Forces and torques are
/// continuous and are replayed on every sub-step of the interval.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BodyDelta {
    /// Teleport to this position.
    pub position: Option<Vec3>,
    /// Set this orientation.
    pub rotation: Option<Quat>,
    /// Set this linear velocity.
    pub linear_velocity: Option<Vec3>,
    /// Set this angular velocity.
    pub angular_velocity: Option<Vec3>,
    /// Switch to this object state.
    pub object_state: Option<ObjectState>,
    /// Accumulated continuous force.
    pub force: Vec3,
    /// Accumulated continuous torque.
    pub torque: Vec3,
    /// Accumulated one-shot linear impulse.
    pub linear_impulse: Vec3,
    /// Accumulated one-shot angular impulse.
    pub angular_impulse: Vec3,
}

impl BodyDelta {
    /// Whether this delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.rotation.is_none()
            && self.linear_velocity.is_none()
            && self.angular_velocity.is_none()
            && self.object_state.is_none()
            && self.force == Vec3::ZERO
            && self.torque == Vec3::ZERO
            && self.linear_impulse == Vec3::ZERO
            && self.angular_impulse == Vec3::ZERO
    }

    /// The substep-replayable subset: forces and torques only.
    pub fn substep_copy(&self) -> BodyDelta {
        BodyDelta {
            force: self.force,
            torque: self.torque,
            ..BodyDelta::default()
        }
    }

    /// Whether the replayable subset is non-zero.
    pub fn has_continuous(&self) -> bool {
        self.force != Vec3::ZERO || self.torque != Vec3::ZERO
    }
}

// ── PushSnapshot ────────────────────────────────────────────────

/// One bundle of producer-authored deltas and inputs.
#[derive(Default)]
pub struct PushSnapshot {
    /// Producer time at which the interval this snapshot belongs to starts.
    /// Shared by all sub-steps of one interval.
    pub start_time: f64,
    /// Step length. Shared by all sub-steps of one interval.
    pub dt: f64,
    /// Producer tick identity. Shared by all sub-steps of one interval.
    pub external_timestamp: ExternalTimestamp,
    /// The simulation step this snapshot was produced for.
    pub internal_step: InternalStep,
    /// Index of this sub-step within the interval.
    pub interval_step: u32,
    /// Number of sub-steps in the interval.
    pub interval_num_steps: u32,
    /// Producer ticks merged into this snapshot (fixed-step mode only
    /// merges ticks that did not accumulate a full step).
    pub producer_ticks: u32,
    /// Per-object deltas. An object appears at most once.
    pub bodies: IndexMap<ProxyHandle, BodyDelta>,
    /// Objects created this tick, with their initial state.
    pub spawned: Vec<(ProxyHandle, RigidState)>,
    /// Objects destroyed this tick.
    pub despawned: Vec<ProxyHandle>,
    /// Callbacks to register before this step.
    pub callbacks_to_add: Vec<(CallbackId, Box<dyn CallbackObject>)>,
    /// Callbacks to unregister before this step.
    pub callbacks_to_remove: SmallVec<[CallbackId; 4]>,
    /// Per-callback inputs for this tick.
    pub callback_inputs: Vec<(CallbackId, CallbackInput)>,
}

impl PushSnapshot {
    /// Mutable access to the delta for `handle`, creating an empty one.
    pub fn body_mut(&mut self, handle: ProxyHandle) -> &mut BodyDelta {
        self.bodies.entry(handle).or_default()
    }

    /// Weight applied to continuous forces: `1 / producer_ticks`.
    ///
    /// Forces accumulated over several producer ticks that end up in one
    /// simulation step are averaged rather than summed.
    pub fn dynamics_weight(&self) -> f32 {
        1.0 / self.producer_ticks.max(1) as f32
    }

    /// Stage a callback input, replacing one already staged this tick.
    pub fn set_callback_input(&mut self, id: CallbackId, input: CallbackInput) {
        match self.callback_inputs.iter_mut().find(|(cid, _)| *cid == id) {
            Some(slot) => slot.1 = input,
            None => self.callback_inputs.push((id, input)),
        }
    }

    /// The input staged for callback `id`, if any.
    pub fn callback_input(&self, id: CallbackId) -> Option<&CallbackInput> {
        self.callback_inputs
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, input)| input)
    }

    /// Copy the substep-replayable data of `first` into `self`.
    ///
    /// Continuous forces and callback inputs are carried over. Property
    /// writes, impulses, spawns, despawns and callback registrations are
    /// not: they already took effect on the first sub-step.
    pub fn copy_substep_data(&mut self, first: &PushSnapshot) {
        self.producer_ticks = first.producer_ticks;
        for (handle, delta) in &first.bodies {
            if delta.has_continuous() {
                self.bodies.insert(*handle, delta.substep_copy());
            }
        }
        self.callback_inputs
            .extend(first.callback_inputs.iter().map(|(id, input)| (*id, input.clone())));
    }

    /// Step timing for sub-step `interval_step` of this snapshot.
    pub fn step_info(&self, resim: bool) -> StepInfo {
        StepInfo {
            dt: self.dt,
            step: self.interval_step,
            num_steps: self.interval_num_steps,
            internal_step: self.internal_step,
            external_timestamp: self.external_timestamp,
            start_time: self.step_start_time(),
            resim,
        }
    }

    /// Producer time at which this particular sub-step starts.
    pub fn step_start_time(&self) -> f64 {
        self.start_time + self.dt * self.interval_step as f64
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
            && self.spawned.is_empty()
            && self.despawned.is_empty()
            && self.callbacks_to_add.is_empty()
            && self.callbacks_to_remove.is_empty()
            && self.callback_inputs.is_empty()
    }
}

impl Poolable for PushSnapshot {
    fn reset(&mut self) {
        self.start_time = 0.0;
        self.dt = 0.0;
        self.external_timestamp = ExternalTimestamp::default();
        self.internal_step = InternalStep::default();
        self.interval_step = 0;
        self.interval_num_steps = 0;
        self.producer_ticks = 0;
        self.bodies.clear();
        self.spawned.clear();
        self.despawned.clear();
        self.callbacks_to_add.clear();
        self.callbacks_to_remove.clear();
        self.callback_inputs.clear();
    }
}

impl fmt::Debug for PushSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSnapshot")
            .field("start_time", &self.start_time)
            .field("dt", &self.dt)
            .field("external_timestamp", &self.external_timestamp)
            .field("internal_step", &self.internal_step)
            .field("interval_step", &self.interval_step)
            .field("interval_num_steps", &self.interval_num_steps)
            .field("producer_ticks", &self.producer_ticks)
            .field("bodies", &self.bodies.len())
            .field("spawned", &self.spawned.len())
            .field("despawned", &self.despawned.len())
            .field("callbacks_to_add", &self.callbacks_to_add.len())
            .field("callbacks_to_remove", &self.callbacks_to_remove.len())
            .field("callback_inputs", &self.callback_inputs.len())
            .finish()
    }
}

// ── PullSnapshot ────────────────────────────────────────────────

/// Result for one constraint touched by a step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstraintResult {
    /// The constraint proxy.
    pub handle: ProxyHandle,
    /// Linear impulse applied by the constraint this step.
    pub linear_impulse: Vec3,
    /// Angular impulse applied by the constraint this step.
    pub angular_impulse: Vec3,
    /// Whether the constraint broke this step.
    pub broken: bool,
}

/// Result for one aggregate (a proxy owning several rigid pieces).
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateResult {
    /// The aggregate proxy.
    pub handle: ProxyHandle,
    /// State of each piece, in the aggregate's own piece order.
    pub pieces: SmallVec<[RigidState; 4]>,
}

/// Results of one completed simulation step.
#[derive(Clone, Debug, Default)]
pub struct PullSnapshot {
    /// Monotonic result identity.
    pub sim_timestamp: SimTimestamp,
    /// Step that produced these results.
    pub internal_step: InternalStep,
    /// Latest producer tick consumed when the step ran.
    pub external_timestamp: ExternalTimestamp,
    /// Producer time at which the step started.
    pub external_start_time: f64,
    /// Producer time at which the step ended: start plus the step's dt.
    pub external_end_time: f64,
    /// Whether the step was a resimulation.
    pub resim: bool,
    /// Dirty rigid objects. An object appears at most once.
    pub rigids: IndexMap<ProxyHandle, RigidState>,
    /// Dirty constraints.
    pub constraints: Vec<ConstraintResult>,
    /// Dirty aggregates.
    pub aggregates: Vec<AggregateResult>,
    /// Objects whose despawn completed during the interval.
    pub despawned: Vec<ProxyHandle>,
}

impl PullSnapshot {
    /// Record the state of a dirty rigid object.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the object was already recorded.
    pub fn push_rigid(&mut self, handle: ProxyHandle, state: RigidState) {
        let previous = self.rigids.insert(handle, state);
        debug_assert!(previous.is_none(), "{handle} recorded twice in one pull snapshot");
    }

    /// The state of `handle` in this snapshot, if it was dirty.
    pub fn rigid(&self, handle: ProxyHandle) -> Option<&RigidState> {
        self.rigids.get(&handle)
    }

    /// Length of the producer-time interval this snapshot covers.
    pub fn interval(&self) -> f64 {
        self.external_end_time - self.external_start_time
    }
}

impl Poolable for PullSnapshot {
    fn reset(&mut self) {
        self.sim_timestamp = SimTimestamp::default();
        self.internal_step = InternalStep::default();
        self.external_timestamp = ExternalTimestamp::default();
        self.external_start_time = 0.0;
        self.external_end_time = 0.0;
        self.resim = false;
        self.rigids.clear();
        self.constraints.clear();
        self.aggregates.clear();
        self.despawned.clear();
    }
}
