//! Simulation-side step execution.
//!
//! [`StepRunner`] owns the opaque [`Simulation`], the registered
//! callbacks and the simulation end of the marshalling link. It executes
//! one push snapshot at a time:
//!
//! 1. apply callback registrations and removals carried by the snapshot,
//! 2. run every callback's `pre_simulate` with its staged input,
//! 3. advance the simulation,
//! 4. publish a pull snapshot (unless the step had zero length),
//! 5. retain the push snapshot for rewinding, or recycle it,
//! 6. ask the rewind callback whether to rewind and replay.
//!
//! It runs either inline on the producer thread or on the dedicated
//! simulation thread; it never knows which.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tether_core::{
    CallbackId, CallbackObject, InternalStep, ProxyHandle, PushSnapshot, RewindCallback,
    SimTimestamp, Simulation, StepInfo,
};

use crate::marshal::SimLink;
use crate::metrics::StepCounters;

// ── StepPhase ─────────────────────────────────────────────────────

/// Where the step pipeline currently is.
///
/// Advisory: in task-thread mode the value is written from both threads
/// and reflects the most recent transition only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StepPhase {
    /// Nothing popped, nothing running.
    Idle = 0,
    /// A push snapshot has been popped but not yet started.
    StepPending = 1,
    /// The simulation is advancing.
    StepRunning = 2,
    /// The advance returned; results are being finalized.
    StepComplete = 3,
}

/// Shared cell holding a [`StepPhase`].
#[derive(Debug, Default)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn load(&self) -> StepPhase {
        match self.0.load(Ordering::Acquire) {
            1 => StepPhase::StepPending,
            2 => StepPhase::StepRunning,
            3 => StepPhase::StepComplete,
            _ => StepPhase::Idle,
        }
    }

    pub(crate) fn store(&self, phase: StepPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

// ── StepRunner ────────────────────────────────────────────────────

/// Executes push snapshots against a [`Simulation`].
pub struct StepRunner<S: Simulation> {
    sim: S,
    link: SimLink,
    callbacks: Vec<(CallbackId, Box<dyn CallbackObject>)>,
    rewind: Option<Box<dyn RewindCallback>>,
    /// Consumed push snapshots, latest first.
    history: VecDeque<Box<PushSnapshot>>,
    history_limit: usize,
    /// Despawns seen since the last published pull snapshot.
    pending_despawns: Vec<ProxyHandle>,
    next_sim_timestamp: SimTimestamp,
    resimulating: bool,
    shutting_down: Arc<AtomicBool>,
    phase: Arc<PhaseCell>,
    counters: Arc<StepCounters>,
}

impl<S: Simulation> StepRunner<S> {
    pub(crate) fn new(
        sim: S,
        link: SimLink,
        rewind: Option<Box<dyn RewindCallback>>,
        history_limit: usize,
        shutting_down: Arc<AtomicBool>,
        phase: Arc<PhaseCell>,
        counters: Arc<StepCounters>,
    ) -> Self {
        Self {
            sim,
            link,
            callbacks: Vec::new(),
            rewind,
            history: VecDeque::with_capacity(history_limit),
            history_limit,
            pending_despawns: Vec::new(),
            next_sim_timestamp: SimTimestamp(0),
            resimulating: false,
            shutting_down,
            phase,
            counters,
        }
    }

    /// Execute one stamped push snapshot.
    pub(crate) fn execute(&mut self, mut push: Box<PushSnapshot>) {
        self.apply_callback_changes(&mut push);
        self.pending_despawns.extend_from_slice(&push.despawned);

        let step = push.step_info(false);
        self.run_step(&push, &step);

        let last_step = push.internal_step;
        self.retain(push);

        if !self.resimulating && !self.shutting_down.load(Ordering::Acquire) {
            self.rewind_if_requested(last_step);
        }
        self.phase.store(StepPhase::Idle);
    }

    fn apply_callback_changes(&mut self, push: &mut PushSnapshot) {
        for (id, callback) in push.callbacks_to_add.drain(..) {
            tracing::debug!(callback = id.0, "callback registered");
            self.callbacks.push((id, callback));
        }
        for id in &push.callbacks_to_remove {
            if let Some(pos) = self.callbacks.iter().position(|(cid, _)| cid == id) {
                let (_, mut callback) = self.callbacks.remove(pos);
                callback.on_removed();
                tracing::debug!(callback = id.0, "callback removed");
            }
        }
    }

    /// Callbacks, advance, publish. Shared by fresh and replayed steps.
    fn run_step(&mut self, push: &PushSnapshot, step: &StepInfo) {
        self.phase.store(StepPhase::StepRunning);
        tracing::trace!(
            step = step.internal_step.0,
            external_ts = step.external_timestamp.0,
            substep = step.step,
            resim = step.resim,
            "step running"
        );
        let start = Instant::now();

        for (id, callback) in &mut self.callbacks {
            callback.pre_simulate_erased(step, push.callback_input(*id));
        }

        if let Err(err) = self.sim.advance(push, step) {
            tracing::warn!(step = step.internal_step.0, error = %err, "simulation step failed");
            self.counters.record_failed();
            return;
        }
        self.phase.store(StepPhase::StepComplete);

        // A zero-length step leaves state untouched: nothing to publish.
        if step.dt > 0.0 {
            let mut pull = self.link.alloc_pull_snapshot();
            self.sim.buffer_results(&mut pull);
            pull.sim_timestamp = self.next_sim_timestamp;
            pull.internal_step = step.internal_step;
            pull.external_timestamp = step.external_timestamp;
            pull.external_start_time = step.start_time;
            pull.external_end_time = step.start_time + step.dt;
            pull.resim = step.resim;
            if step.is_last_step() {
                pull.despawned.append(&mut self.pending_despawns);
            }
            self.next_sim_timestamp = SimTimestamp(self.next_sim_timestamp.0 + 1);
            self.link.publish(pull);
            self.counters
                .record_published(self.link.pull_backing_allocations());
        }
        self.counters
            .record_completed(start.elapsed().as_micros() as u64);
    }

    fn retain(&mut self, push: Box<PushSnapshot>) {
        if self.history_limit == 0 {
            self.link.free_push_snapshot(push);
            return;
        }
        self.history.push_front(push);
        while self.history.len() > self.history_limit {
            if let Some(old) = self.history.pop_back() {
                self.link.free_push_snapshot(old);
            }
        }
    }

    fn rewind_if_requested(&mut self, last_step: InternalStep) {
        let Some(rewind) = self.rewind.as_mut() else {
            return;
        };
        let Some(target) = rewind.trigger_rewind_if_needed(last_step) else {
            return;
        };
        if target > last_step {
            tracing::warn!(target = target.0, last = last_step.0, "rewind target is in the future");
            return;
        }
        let oldest = self.history.back().map(|p| p.internal_step);
        if oldest.is_none_or(|oldest| oldest > target) {
            tracing::warn!(
                target = target.0,
                oldest = oldest.map(|s| s.0),
                "rewind target outside retained history"
            );
            return;
        }
        if !self.sim.rewind_to_step(target) {
            tracing::warn!(target = target.0, "simulation refused rewind");
            return;
        }

        tracing::debug!(from = last_step.0, to = target.0, "resimulating");
        self.resimulating = true;
        // Oldest first: history is stored latest first.
        let replay: Vec<usize> = (0..self.history.len())
            .rev()
            .filter(|&i| self.history[i].internal_step >= target)
            .collect();
        let mut first = true;
        for i in replay {
            let step_index = self.history[i].internal_step;
            if let Some(rewind) = self.rewind.as_mut() {
                rewind.pre_resim_step(step_index, first);
            }
            // Out of the history while the step borrows `self`.
            let Some(push) = self.history.remove(i) else {
                continue;
            };
            let step = push.step_info(true);
            self.run_step(&push, &step);
            self.history.insert(i, push);
            self.counters.record_resim_step();
            if let Some(rewind) = self.rewind.as_mut() {
                rewind.post_resim_step(step_index);
            }
            first = false;
        }
        self.resimulating = false;
    }

    /// Drop all registered callbacks and retained history and reset the
    /// simulation for a new episode.
    pub(crate) fn reset(&mut self) {
        for (_, mut callback) in self.callbacks.drain(..) {
            callback.on_removed();
        }
        for push in self.history.drain(..) {
            self.link.free_push_snapshot(push);
        }
        self.pending_despawns.clear();
        self.next_sim_timestamp = SimTimestamp(0);
        self.resimulating = false;
        self.sim.reset();
    }

    /// Swap in a fresh marshalling endpoint and counters after a reset.
    pub(crate) fn relink(
        &mut self,
        link: SimLink,
        shutting_down: Arc<AtomicBool>,
        counters: Arc<StepCounters>,
    ) {
        self.link = link;
        self.shutting_down = shutting_down;
        self.counters = counters;
    }

    /// The simulation, for inspection.
    pub fn simulation(&self) -> &S {
        &self.sim
    }

    /// Number of callbacks currently registered.
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}
