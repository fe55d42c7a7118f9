//! Producer → simulation handoff of push snapshots, and the return path
//! for pull snapshots.
//!
//! [`link`] creates the two halves:
//!
//! ```text
//! Producer thread                         Simulation side
//! MarshallingManager                      SimLink
//! ├── push pool ◄──── recycled push ───── free_push_snapshot()
//! ├── current push snapshot
//! ├── FIFO of stamped steps ── pop_next_internal_step() ──► StepRunner
//! ├── pull_rx ◄──────── published pull ── publish()
//! └── free_pull_snapshot() ── recycled ──► pull pool
//! ```
//!
//! Each pool is allocated from only by the side that owns it. Nothing on
//! either path blocks.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tether_arena::{Recycler, SnapshotPool};
use tether_core::{ExternalTimestamp, InternalStep, PullSnapshot, PushSnapshot};

use crate::dispatch::DispatchError;

/// Create a connected producer/simulation pair.
///
/// `artificial_delay` is the number of initial
/// [`pop_next_internal_step`](MarshallingManager::pop_next_internal_step)
/// calls that yield nothing even when steps are queued.
pub fn link(artificial_delay: u32) -> (MarshallingManager, SimLink) {
    let push_pool = SnapshotPool::new("push");
    let pull_pool = SnapshotPool::new("pull");
    let (pull_tx, pull_rx) = unbounded();

    let sim = SimLink {
        push_recycler: push_pool.recycler(),
        pull_recycler: pull_pool.recycler(),
        pull_pool,
        pull_tx,
    };
    let producer = MarshallingManager {
        push_pool,
        current: None,
        queue: VecDeque::new(),
        delay_remaining: artificial_delay,
        external_timestamp: ExternalTimestamp::default(),
        external_time: 0.0,
        next_internal_step: InternalStep::default(),
        pull_rx,
        pull_recycler: sim.pull_recycler.clone(),
    };
    (producer, sim)
}

// ── MarshallingManager ────────────────────────────────────────────

/// Producer-side owner of the push snapshot queue.
pub struct MarshallingManager {
    push_pool: SnapshotPool<PushSnapshot>,
    current: Option<Box<PushSnapshot>>,
    queue: VecDeque<Box<PushSnapshot>>,
    delay_remaining: u32,
    external_timestamp: ExternalTimestamp,
    external_time: f64,
    next_internal_step: InternalStep,
    pull_rx: Receiver<Box<PullSnapshot>>,
    pull_recycler: Recycler<PullSnapshot>,
}

impl MarshallingManager {
    /// The snapshot the producer is currently writing into.
    pub fn get_current_push_snapshot(&mut self) -> &mut PushSnapshot {
        let pool = &mut self.push_pool;
        self.current.get_or_insert_with(|| pool.alloc())
    }

    /// Count a producer tick that did not produce a step.
    ///
    /// The current snapshot keeps accumulating; its continuous forces are
    /// later averaged over every tick merged into it.
    pub fn note_producer_tick(&mut self) {
        self.get_current_push_snapshot().producer_ticks += 1;
    }

    /// Close the current producer tick as `num_steps` steps of length `dt`.
    ///
    /// The current snapshot becomes the first step. Each further step gets
    /// a fresh snapshot carrying only the substep-replayable data of the
    /// first. All steps share the tick's start time, dt and external
    /// timestamp. A new current snapshot is allocated for the next tick.
    pub fn advance_external(&mut self, dt: f64, num_steps: u32) -> Result<(), DispatchError> {
        if num_steps == 0 {
            return Err(DispatchError::ZeroSteps);
        }

        let ts = self.external_timestamp;
        let start_time = self.external_time;

        let mut first = match self.current.take() {
            Some(snap) => snap,
            None => self.push_pool.alloc(),
        };
        first.producer_ticks += 1;
        self.stamp(&mut first, start_time, dt, ts, 0, num_steps);
        tracing::trace!(
            external_ts = ts.0,
            internal_step = first.internal_step.0,
            num_steps,
            dt,
            "push snapshot enqueued"
        );
        self.queue.push_back(first);
        let first_idx = self.queue.len() - 1;

        for step in 1..num_steps {
            let mut sub = self.push_pool.alloc();
            sub.copy_substep_data(&self.queue[first_idx]);
            self.stamp(&mut sub, start_time, dt, ts, step, num_steps);
            self.queue.push_back(sub);
        }

        self.external_timestamp = ts.next();
        self.external_time = start_time + dt * num_steps as f64;
        self.current = Some(self.push_pool.alloc());
        Ok(())
    }

    fn stamp(
        &mut self,
        snap: &mut PushSnapshot,
        start_time: f64,
        dt: f64,
        ts: ExternalTimestamp,
        interval_step: u32,
        interval_num_steps: u32,
    ) {
        snap.start_time = start_time;
        snap.dt = dt;
        snap.external_timestamp = ts;
        snap.internal_step = self.next_internal_step;
        snap.interval_step = interval_step;
        snap.interval_num_steps = interval_num_steps;
        self.next_internal_step = InternalStep(self.next_internal_step.0 + 1);
    }

    /// Oldest queued step, or `None` if the queue is empty or the
    /// artificial delay is still counting down.
    pub fn pop_next_internal_step(&mut self) -> Option<Box<PushSnapshot>> {
        if self.delay_remaining > 0 {
            self.delay_remaining -= 1;
            tracing::debug!(remaining = self.delay_remaining, "artificial delay");
            return None;
        }
        self.queue.pop_front()
    }

    /// Oldest queued step regardless of the artificial delay. Used when
    /// draining on shutdown.
    pub fn pop_for_drain(&mut self) -> Option<Box<PushSnapshot>> {
        self.queue.pop_front()
    }

    /// Number of stamped steps waiting to be popped.
    pub fn pending_steps(&self) -> usize {
        self.queue.len()
    }

    /// Return a push snapshot popped on this side to the pool.
    pub fn free_push_snapshot(&mut self, snapshot: Box<PushSnapshot>) {
        self.push_pool.free(snapshot);
    }

    /// Next published pull snapshot, if any.
    pub fn pop_pull_snapshot(&mut self) -> Option<Box<PullSnapshot>> {
        self.pull_rx.try_recv().ok()
    }

    /// Number of published pull snapshots not yet popped.
    pub fn pending_pulls(&self) -> usize {
        self.pull_rx.len()
    }

    /// Return a consumed pull snapshot to the simulation side's pool.
    pub fn free_pull_snapshot(&self, snapshot: Box<PullSnapshot>) {
        self.pull_recycler.recycle(snapshot);
    }

    /// Timestamp the next `advance_external` call will stamp.
    pub fn external_timestamp(&self) -> ExternalTimestamp {
        self.external_timestamp
    }

    /// Producer time at which the next interval starts.
    pub fn external_time(&self) -> f64 {
        self.external_time
    }

    /// Step index the next stamped snapshot will carry.
    pub fn next_internal_step(&self) -> InternalStep {
        self.next_internal_step
    }

    /// Distinct push snapshots ever allocated.
    pub fn push_backing_allocations(&self) -> usize {
        self.push_pool.backing_allocations()
    }
}

// ── SimLink ───────────────────────────────────────────────────────

/// Simulation-side endpoint: frees push snapshots, allocates and
/// publishes pull snapshots.
pub struct SimLink {
    push_recycler: Recycler<PushSnapshot>,
    pull_pool: SnapshotPool<PullSnapshot>,
    pull_recycler: Recycler<PullSnapshot>,
    pull_tx: Sender<Box<PullSnapshot>>,
}

impl SimLink {
    /// Return a fully consumed push snapshot to the producer's pool.
    pub fn free_push_snapshot(&self, snapshot: Box<PushSnapshot>) {
        self.push_recycler.recycle(snapshot);
    }

    /// A reset pull snapshot from this side's pool.
    pub fn alloc_pull_snapshot(&mut self) -> Box<PullSnapshot> {
        self.pull_pool.alloc()
    }

    /// Hand a finished pull snapshot to the producer.
    pub fn publish(&self, snapshot: Box<PullSnapshot>) {
        if let Err(err) = self.pull_tx.send(snapshot) {
            // Producer gone: keep the buffer in the pool.
            self.pull_recycler.recycle(err.into_inner());
        }
    }

    /// Distinct pull snapshots ever allocated.
    pub fn pull_backing_allocations(&self) -> usize {
        self.pull_pool.backing_allocations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tether_core::{CallbackId, ProxyHandle, Vec3};

    fn addr(snap: &PushSnapshot) -> usize {
        snap as *const PushSnapshot as usize
    }

    #[test]
    fn zero_steps_rejected() {
        let (mut mm, _sim) = link(0);
        assert_eq!(mm.advance_external(0.1, 0), Err(DispatchError::ZeroSteps));
        assert_eq!(mm.external_timestamp(), ExternalTimestamp(0));
        assert_eq!(mm.pending_steps(), 0);
    }

    #[test]
    fn substeps_share_tick_identity() {
        let (mut mm, _sim) = link(0);
        mm.get_current_push_snapshot().start_time = 99.0;
        mm.advance_external(0.25, 3).unwrap();

        let steps: Vec<_> = std::iter::from_fn(|| mm.pop_next_internal_step()).collect();
        assert_eq!(steps.len(), 3);
        for (i, s) in steps.iter().enumerate() {
            assert_eq!(s.external_timestamp, ExternalTimestamp(0));
            assert_eq!(s.dt, 0.25);
            assert_eq!(s.start_time, 0.0, "stamping overwrites producer writes");
            assert_eq!(s.interval_step, i as u32);
            assert_eq!(s.interval_num_steps, 3);
            assert_eq!(s.internal_step, InternalStep(i as u64));
        }
        assert_eq!(mm.external_time(), 0.75);
    }

    #[test]
    fn one_shot_data_not_replicated_to_later_substeps() {
        let (mut mm, _sim) = link(0);
        let h = ProxyHandle::new(0, 0);
        {
            let snap = mm.get_current_push_snapshot();
            let body = snap.body_mut(h);
            body.force = Vec3::new(1.0, 0.0, 0.0);
            body.linear_impulse = Vec3::new(0.0, 5.0, 0.0);
            snap.callback_inputs.push((CallbackId(3), Arc::new(7u8)));
        }
        mm.advance_external(0.1, 2).unwrap();

        let first = mm.pop_next_internal_step().unwrap();
        let second = mm.pop_next_internal_step().unwrap();
        assert_eq!(first.bodies[&h].linear_impulse, Vec3::new(0.0, 5.0, 0.0));
        assert_eq!(second.bodies[&h].linear_impulse, Vec3::ZERO);
        assert_eq!(second.bodies[&h].force, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(second.callback_inputs.len(), 1);
        assert_eq!(second.producer_ticks, first.producer_ticks);
    }

    #[test]
    fn pop_returns_snapshot_written_by_producer() {
        let (mut mm, sim) = link(0);
        for _ in 0..10 {
            let written = addr(mm.get_current_push_snapshot());
            mm.advance_external(1.0 / 30.0, 1).unwrap();
            let popped = mm.pop_next_internal_step().unwrap();
            assert_eq!(addr(&popped), written);
            assert!(mm.pop_next_internal_step().is_none());
            sim.free_push_snapshot(popped);
        }
    }

    #[test]
    fn equal_dt_reuses_two_buffers() {
        let (mut mm, sim) = link(0);
        let mut seen = HashSet::new();
        for step in 0..10 {
            let written = addr(mm.get_current_push_snapshot());
            if step > 0 {
                seen.insert(written);
            }
            mm.advance_external(1.0 / 60.0, 1).unwrap();
            let popped = mm.pop_next_internal_step().unwrap();
            sim.free_push_snapshot(popped);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(mm.push_backing_allocations(), 2);
    }

    #[test]
    fn double_internal_dt_reuses_three_buffers() {
        let (mut mm, sim) = link(0);
        let mut seen = HashSet::new();
        for step in 0..10 {
            let written = addr(mm.get_current_push_snapshot());
            if step > 0 {
                seen.insert(written);
            }
            mm.advance_external(1.0 / 60.0, 1).unwrap();
            if step % 2 == 1 {
                while let Some(popped) = mm.pop_next_internal_step() {
                    sim.free_push_snapshot(popped);
                }
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(mm.push_backing_allocations(), 3);
    }

    #[test]
    fn artificial_delay_lags_by_fixed_count() {
        let (mut mm, _sim) = link(2);
        mm.advance_external(0.1, 1).unwrap();
        assert!(mm.pop_next_internal_step().is_none());
        mm.advance_external(0.1, 1).unwrap();
        assert!(mm.pop_next_internal_step().is_none());
        mm.advance_external(0.1, 1).unwrap();
        let s = mm.pop_next_internal_step().unwrap();
        assert_eq!(s.external_timestamp, ExternalTimestamp(0));
        assert_eq!(mm.pending_steps(), 2);
        assert_eq!(
            mm.pop_for_drain().unwrap().external_timestamp,
            ExternalTimestamp(1)
        );
    }

    #[test]
    fn merged_ticks_count_toward_dynamics_weight() {
        let (mut mm, _sim) = link(0);
        mm.note_producer_tick();
        mm.note_producer_tick();
        mm.advance_external(0.1, 1).unwrap();
        let s = mm.pop_next_internal_step().unwrap();
        assert_eq!(s.producer_ticks, 3);
        assert!((s.dynamics_weight() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn pull_snapshots_round_trip_to_sim_pool() {
        let (mut mm, mut sim) = link(0);
        let mut pull = sim.alloc_pull_snapshot();
        pull.external_end_time = 1.0;
        let pull_addr = &*pull as *const PullSnapshot as usize;
        sim.publish(pull);

        assert_eq!(mm.pending_pulls(), 1);
        let got = mm.pop_pull_snapshot().unwrap();
        assert_eq!(got.external_end_time, 1.0);
        mm.free_pull_snapshot(got);

        let again = sim.alloc_pull_snapshot();
        assert_eq!(&*again as *const PullSnapshot as usize, pull_addr);
        assert_eq!(again.external_end_time, 0.0);
        assert_eq!(sim.pull_backing_allocations(), 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn external_timestamp_increments_once_per_call(
                steps in prop::collection::vec(1u32..6, 1..40)
            ) {
                let (mut mm, sim) = link(0);
                let mut last: Option<ExternalTimestamp> = None;
                for n in steps {
                    mm.advance_external(0.01, n).unwrap();
                    let mut ts_this_call = None;
                    while let Some(s) = mm.pop_next_internal_step() {
                        if let Some(ts) = ts_this_call {
                            prop_assert_eq!(ts, s.external_timestamp);
                        }
                        ts_this_call = Some(s.external_timestamp);
                        sim.free_push_snapshot(s);
                    }
                    let ts = ts_this_call.unwrap();
                    if let Some(prev) = last {
                        prop_assert_eq!(ts.0, prev.0 + 1);
                    }
                    last = Some(ts);
                }
            }
        }
    }
}
