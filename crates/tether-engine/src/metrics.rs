//! Pipeline counters.
//!
//! [`PipelineMetrics`] is a plain snapshot assembled by
//! `Solver::metrics()`. Simulation-side counters are written by the step
//! runner into [`StepCounters`] atomics so they can be read from the
//! producer thread while the simulation thread keeps running.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative pipeline counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Steps handed to the step runner.
    pub steps_dispatched: u64,
    /// Steps whose simulation advance returned successfully.
    pub steps_completed: u64,
    /// Steps whose simulation advance returned an error.
    pub steps_failed: u64,
    /// Steps replayed after a rewind.
    pub resim_steps: u64,
    /// Producer ticks that did not accumulate a full fixed step.
    pub ticks_merged: u64,
    /// Pull snapshots published by the step runner.
    pub pulls_published: u64,
    /// Pull snapshots discarded by synchronous pulls collapsing the queue.
    pub pulls_collapsed: u64,
    /// Per-object results dropped because the proxy was despawned.
    pub stale_results_dropped: u64,
    /// Pull snapshots recognised as resimulated.
    pub resim_results: u64,
    /// Divergence records created.
    pub divergences_detected: u64,
    /// Divergence records retired after the leash completed.
    pub divergences_retired: u64,
    /// Distinct push snapshots ever allocated.
    pub push_backing_allocations: u64,
    /// Distinct pull snapshots ever allocated.
    pub pull_backing_allocations: u64,
    /// Wall-clock duration of the most recent step, in microseconds.
    pub last_step_us: u64,
}

/// Atomic counters written by the step runner.
#[derive(Debug, Default)]
pub struct StepCounters {
    steps_completed: AtomicU64,
    steps_failed: AtomicU64,
    resim_steps: AtomicU64,
    pulls_published: AtomicU64,
    pull_backing_allocations: AtomicU64,
    last_step_us: AtomicU64,
}

impl StepCounters {
    pub(crate) fn record_completed(&self, elapsed_us: u64) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
        self.last_step_us.store(elapsed_us, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resim_step(&self) {
        self.resim_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, pull_backing: usize) {
        self.pulls_published.fetch_add(1, Ordering::Relaxed);
        self.pull_backing_allocations
            .store(pull_backing as u64, Ordering::Relaxed);
    }

    /// Copy the simulation-side counters into `out`.
    pub fn fill(&self, out: &mut PipelineMetrics) {
        out.steps_completed = self.steps_completed.load(Ordering::Relaxed);
        out.steps_failed = self.steps_failed.load(Ordering::Relaxed);
        out.resim_steps = self.resim_steps.load(Ordering::Relaxed);
        out.pulls_published = self.pulls_published.load(Ordering::Relaxed);
        out.pull_backing_allocations = self.pull_backing_allocations.load(Ordering::Relaxed);
        out.last_step_us = self.last_step_us.load(Ordering::Relaxed);
    }
}
