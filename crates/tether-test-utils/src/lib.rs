//! Test utilities and mock simulations for Tether development.
//!
//! [`BallisticSim`] is a deterministic stand-in for a physics solver:
//! dynamic bodies fall under gravity, forces and impulses change their
//! velocity, and the state at the start of every step is saved so the
//! simulation can rewind. [`fixtures`] holds scripted rewind and
//! recording callbacks.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{RecordingCallback, ScriptedRewind};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tether_core::{
    InternalStep, ObjectState, ProxyHandle, PullSnapshot, PushSnapshot, Quat, RigidState,
    SimulationError, Simulation, StepInfo, Vec3,
};

/// One executed step as seen by [`BallisticSim`].
#[derive(Clone, Debug, PartialEq)]
pub struct StepRecord {
    pub info: StepInfo,
    pub producer_ticks: u32,
    pub spawned: usize,
    pub despawned: usize,
    /// Bodies with a non-zero linear impulse in this step's snapshot.
    pub impulses: usize,
}

type BodyMap = IndexMap<ProxyHandle, RigidState>;

/// Deterministic ballistic integrator implementing [`Simulation`].
pub struct BallisticSim {
    bodies: BodyMap,
    dirty: IndexSet<ProxyHandle>,
    gravity: Vec3,
    /// Body state at the start of each step, latest first.
    saved: VecDeque<(InternalStep, BodyMap)>,
    save_limit: usize,
    fail_at: Option<InternalStep>,
    resim_nudge: Vec3,
    step_delay: Option<Duration>,
    log: Arc<Mutex<Vec<StepRecord>>>,
}

impl BallisticSim {
    /// Zero gravity, rewindable over the last 64 steps.
    pub fn new() -> Self {
        Self {
            bodies: IndexMap::new(),
            dirty: IndexSet::new(),
            gravity: Vec3::ZERO,
            saved: VecDeque::new(),
            save_limit: 64,
            fail_at: None,
            resim_nudge: Vec3::ZERO,
            step_delay: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Constant acceleration applied to dynamic bodies.
    pub fn with_gravity(mut self, gravity: Vec3) -> Self {
        self.gravity = gravity;
        self
    }

    /// Fail the advance of `step` with [`SimulationError::ExecutionFailed`].
    pub fn fail_at(mut self, step: InternalStep) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Offset added to every dynamic body on replayed steps, so replays
    /// diverge from the original run.
    pub fn with_resim_nudge(mut self, nudge: Vec3) -> Self {
        self.resim_nudge = nudge;
        self
    }

    /// Sleep this long in every advance.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Shared log of every executed step.
    pub fn log(&self) -> Arc<Mutex<Vec<StepRecord>>> {
        Arc::clone(&self.log)
    }

    /// Current state of a body.
    pub fn body(&self, handle: ProxyHandle) -> Option<&RigidState> {
        self.bodies.get(&handle)
    }

    /// Number of live bodies.
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    fn apply_push(&mut self, push: &PushSnapshot, dt: f32) -> Result<(), SimulationError> {
        for (handle, initial) in &push.spawned {
            self.bodies.insert(*handle, *initial);
            self.dirty.insert(*handle);
        }
        let weight = push.dynamics_weight();
        for (handle, delta) in &push.bodies {
            let body = self
                .bodies
                .get_mut(handle)
                .ok_or(SimulationError::UnknownProxy { handle: *handle })?;
            if let Some(p) = delta.position {
                body.position = p;
            }
            if let Some(r) = delta.rotation {
                body.rotation = r;
            }
            if let Some(v) = delta.linear_velocity {
                body.linear_velocity = v;
            }
            if let Some(w) = delta.angular_velocity {
                body.angular_velocity = w;
            }
            if let Some(s) = delta.object_state {
                body.object_state = s;
            }
            body.linear_velocity += delta.linear_impulse + delta.force * weight * dt;
            body.angular_velocity += delta.angular_impulse + delta.torque * weight * dt;
            self.dirty.insert(*handle);
        }
        for handle in &push.despawned {
            self.bodies.shift_remove(handle);
            self.dirty.shift_remove(handle);
        }
        Ok(())
    }

    fn integrate(&mut self, step: &StepInfo, dt: f32) -> Result<(), SimulationError> {
        for (handle, body) in &mut self.bodies {
            if body.object_state != ObjectState::Dynamic {
                continue;
            }
            body.linear_velocity += self.gravity * dt;
            body.position += body.linear_velocity * dt;
            let spin = Quat::from_scaled_axis(body.angular_velocity * dt);
            body.rotation = (spin * body.rotation).normalize();
            if step.resim {
                body.position += self.resim_nudge;
            }
            if !body.is_finite() {
                return Err(SimulationError::NonFinite {
                    handle: *handle,
                    step: step.internal_step,
                });
            }
            self.dirty.insert(*handle);
        }
        Ok(())
    }
}

impl Default for BallisticSim {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation for BallisticSim {
    fn advance(&mut self, push: &PushSnapshot, step: &StepInfo) -> Result<(), SimulationError> {
        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }
        if self.fail_at == Some(step.internal_step) {
            return Err(SimulationError::ExecutionFailed {
                reason: format!("scripted failure at step {}", step.internal_step.0),
            });
        }

        self.saved.push_front((step.internal_step, self.bodies.clone()));
        self.saved.truncate(self.save_limit);

        if let Ok(mut log) = self.log.lock() {
            log.push(StepRecord {
                info: *step,
                producer_ticks: push.producer_ticks,
                spawned: push.spawned.len(),
                despawned: push.despawned.len(),
                impulses: push
                    .bodies
                    .values()
                    .filter(|d| d.linear_impulse != Vec3::ZERO)
                    .count(),
            });
        }

        self.dirty.clear();
        let dt = step.dt as f32;
        self.apply_push(push, dt)?;
        self.integrate(step, dt)
    }

    fn buffer_results(&mut self, out: &mut PullSnapshot) {
        for handle in &self.dirty {
            if let Some(state) = self.bodies.get(handle) {
                out.push_rigid(*handle, *state);
            }
        }
    }

    fn rewind_to_step(&mut self, step: InternalStep) -> bool {
        let Some(pos) = self.saved.iter().position(|(s, _)| *s == step) else {
            return false;
        };
        self.bodies = self.saved[pos].1.clone();
        // Replayed steps save their start state again.
        self.saved.drain(..=pos);
        true
    }

    fn reset(&mut self) {
        self.bodies.clear();
        self.dirty.clear();
        self.saved.clear();
    }
}
