//! Step slicing and scheduling.
//!
//! The [`Dispatcher`] turns producer ticks into simulation steps and
//! drives the [`StepRunner`] with them, either inline or on a dedicated
//! simulation thread:
//!
//! ```text
//! Producer thread                           tether-sim thread
//!     |                                         |
//!     |--advance(dt)                            |
//!     |   slice dt → (step_dt, n)               |
//!     |   marshal.advance_external(step_dt, n)  |
//!     |   pop n steps → backlog                 |
//!     |   try_send ──────[task_tx: bounded]───► | runner.execute(push)
//!     |   keep done_rx of the last two tasks    | done_tx.send(())
//!     |                                         |
//!     |--wait(block_mode)                       |
//!     |   send backlog, done_rx.recv() ◄────────|
//! ```
//!
//! The simulation thread consumes tasks strictly in order, so each task
//! implicitly depends on the one before it and steps never overlap.
//! Dispatching never blocks: tasks that do not fit in the channel wait in
//! a producer-side backlog, in order, until the next `advance` or a
//! blocking `wait` hands them over.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tether_core::{PushSnapshot, Simulation};

use crate::config::{BlockMode, ConfigError, SolverConfig, ThreadingMode};
use crate::marshal::MarshallingManager;
use crate::step::{PhaseCell, StepPhase, StepRunner};

// ── DispatchError ─────────────────────────────────────────────────

/// Errors from advancing or waiting on the pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DispatchError {
    /// The solver has been shut down.
    ShutDown,
    /// A producer tick was closed with zero steps.
    ZeroSteps,
    /// The simulation thread exited unexpectedly (e.g. it panicked).
    WorkerLost,
    /// The producer passed a negative or non-finite dt.
    InvalidDt {
        /// The rejected value.
        value: f64,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "solver has shut down"),
            Self::ZeroSteps => write!(f, "advance_external requires at least one step"),
            Self::WorkerLost => write!(f, "simulation thread exited unexpectedly"),
            Self::InvalidDt { value } => {
                write!(f, "dt must be finite and non-negative, got {value}")
            }
        }
    }
}

impl Error for DispatchError {}

// ── DrainReport ───────────────────────────────────────────────────

/// Outcome of draining the dispatcher on shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Queued steps executed during the drain.
    pub drained_steps: u64,
    /// Whether the simulation thread (if any) was joined cleanly.
    pub joined: bool,
}

// ── Task thread ───────────────────────────────────────────────────

struct StepTask {
    push: Box<PushSnapshot>,
    done: Sender<()>,
}

fn run_task_loop<S: Simulation>(mut runner: StepRunner<S>, tasks: Receiver<StepTask>) -> StepRunner<S> {
    while let Ok(task) = tasks.recv() {
        runner.execute(task.push);
        // Producer may have stopped tracking this task.
        let _ = task.done.send(());
    }
    tracing::debug!("simulation thread exiting");
    runner
}

/// Hand backlogged tasks to the simulation thread, oldest first. Without
/// `block`, stops at the first task the full channel refuses.
fn flush_backlog(
    tasks: &Sender<StepTask>,
    backlog: &mut VecDeque<StepTask>,
    block: bool,
) -> Result<(), DispatchError> {
    while let Some(task) = backlog.pop_front() {
        if block {
            tasks.send(task).map_err(|_| DispatchError::WorkerLost)?;
            continue;
        }
        match tasks.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                backlog.push_front(task);
                break;
            }
            Err(TrySendError::Disconnected(_)) => return Err(DispatchError::WorkerLost),
        }
    }
    Ok(())
}

enum Mode<S: Simulation> {
    Inline(StepRunner<S>),
    Task {
        tasks: Sender<StepTask>,
        thread: JoinHandle<StepRunner<S>>,
        /// Completion handles of the latest tasks, oldest first.
        in_flight: VecDeque<Receiver<()>>,
        /// Dispatched tasks the full channel has not accepted yet.
        backlog: VecDeque<StepTask>,
    },
    Stopped,
}

// ── Dispatcher ────────────────────────────────────────────────────

/// Slices producer time into steps and schedules them.
pub struct Dispatcher<S: Simulation> {
    mode: Mode<S>,
    fixed_dt: Option<f64>,
    max_step_dt: Option<f64>,
    max_substeps: u32,
    accumulated: f64,
    last_step_dt: f64,
    shutting_down: Arc<AtomicBool>,
    phase: Arc<PhaseCell>,
    steps_dispatched: u64,
    ticks_merged: u64,
    recovered: Option<StepRunner<S>>,
}

impl<S: Simulation> Dispatcher<S> {
    /// Create a dispatcher, spawning the simulation thread in
    /// [`ThreadingMode::TaskThread`].
    pub(crate) fn new(
        runner: StepRunner<S>,
        config: &SolverConfig,
        shutting_down: Arc<AtomicBool>,
        phase: Arc<PhaseCell>,
    ) -> Result<Self, ConfigError> {
        let mode = match config.threading {
            ThreadingMode::SingleThreaded => Mode::Inline(runner),
            ThreadingMode::TaskThread => {
                let (tasks, task_rx) = bounded(config.task_queue_capacity);
                let thread = thread::Builder::new()
                    .name("tether-sim".into())
                    .spawn(move || run_task_loop(runner, task_rx))
                    .map_err(|e| ConfigError::ThreadSpawnFailed {
                        reason: format!("simulation thread: {e}"),
                    })?;
                Mode::Task {
                    tasks,
                    thread,
                    in_flight: VecDeque::with_capacity(2),
                    backlog: VecDeque::new(),
                }
            }
        };
        Ok(Self {
            mode,
            fixed_dt: config.fixed_dt,
            max_step_dt: config.max_step_dt,
            max_substeps: config.max_substeps,
            accumulated: 0.0,
            last_step_dt: config.fixed_dt.unwrap_or(0.0),
            shutting_down,
            phase,
            steps_dispatched: 0,
            ticks_merged: 0,
            recovered: None,
        })
    }

    /// Split a producer `dt` into `(step_dt, num_steps)`.
    ///
    /// Fixed-step mode accumulates producer time and emits
    /// `floor(accumulated / fixed_dt)` steps, keeping the remainder. A
    /// `dt` of exactly zero flushes the remainder as one final step.
    /// Variable-step mode emits one step of `dt`, split into equal
    /// sub-steps when `dt` exceeds `max_step_dt`.
    pub fn slice(&mut self, dt: f64) -> Result<(f64, u32), DispatchError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(DispatchError::InvalidDt { value: dt });
        }
        if dt == 0.0 {
            let remainder = std::mem::take(&mut self.accumulated);
            return Ok((remainder, 1));
        }
        match self.fixed_dt {
            Some(fixed) => {
                self.accumulated += dt;
                // Tolerate accumulated rounding just below a whole step.
                let n = (self.accumulated / fixed + 1e-9).floor();
                self.accumulated = (self.accumulated - n * fixed).max(0.0);
                Ok((fixed, n as u32))
            }
            None => match self.max_step_dt {
                Some(max) if dt > max => {
                    let n = ((dt / max).ceil() as u32).clamp(1, self.max_substeps);
                    Ok((dt / n as f64, n))
                }
                _ => Ok((dt, 1)),
            },
        }
    }

    /// Close one producer tick of length `dt` and dispatch its steps.
    ///
    /// Returns the number of steps handed to the runner, which can be
    /// less than the number sliced while an artificial delay counts down.
    pub fn advance(&mut self, marshal: &mut MarshallingManager, dt: f64) -> Result<u32, DispatchError> {
        if matches!(self.mode, Mode::Stopped) {
            return Err(DispatchError::ShutDown);
        }
        let (step_dt, num_steps) = self.slice(dt)?;
        if num_steps == 0 {
            marshal.note_producer_tick();
            self.ticks_merged += 1;
            tracing::trace!(accumulated = self.accumulated, "tick merged into pending step");
            return Ok(0);
        }

        marshal.advance_external(step_dt, num_steps)?;
        if step_dt > 0.0 {
            self.last_step_dt = step_dt;
        }

        let mut dispatched = 0;
        for _ in 0..num_steps {
            if let Some(push) = marshal.pop_next_internal_step() {
                self.dispatch(push)?;
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&mut self, push: Box<PushSnapshot>) -> Result<(), DispatchError> {
        self.phase.store(StepPhase::StepPending);
        self.steps_dispatched += 1;
        match &mut self.mode {
            Mode::Inline(runner) => {
                runner.execute(push);
                Ok(())
            }
            Mode::Task {
                tasks,
                in_flight,
                backlog,
                ..
            } => {
                let (done, done_rx) = bounded(1);
                backlog.push_back(StepTask { push, done });
                in_flight.push_back(done_rx);
                while in_flight.len() > 2 {
                    in_flight.pop_front();
                }
                flush_backlog(tasks, backlog, false)
            }
            Mode::Stopped => Err(DispatchError::ShutDown),
        }
    }

    /// Block according to `block_mode` until the required step completed.
    ///
    /// Inline mode never blocks: every step completed inside `advance`.
    /// [`BlockMode::NoBlock`] only offers backlogged tasks to the channel.
    pub fn wait(&mut self, block_mode: BlockMode) -> Result<(), DispatchError> {
        let Mode::Task {
            tasks,
            in_flight,
            backlog,
            ..
        } = &mut self.mode
        else {
            return Ok(());
        };
        let keep = match block_mode {
            BlockMode::BlockOnLatest => 0,
            BlockMode::BlockOnSecondLatest => 1,
            BlockMode::NoBlock => return flush_backlog(tasks, backlog, false),
        };
        flush_backlog(tasks, backlog, true)?;
        while in_flight.len() > keep {
            if let Some(done) = in_flight.pop_front() {
                done.recv().map_err(|_| DispatchError::WorkerLost)?;
            }
        }
        Ok(())
    }

    /// Tasks whose completion the producer is still tracking (at most 2).
    pub fn in_flight(&self) -> usize {
        match &self.mode {
            Mode::Task { in_flight, .. } => in_flight.len(),
            _ => 0,
        }
    }

    /// Dispatched tasks still waiting for room in the task channel.
    pub fn backlog(&self) -> usize {
        match &self.mode {
            Mode::Task { backlog, .. } => backlog.len(),
            _ => 0,
        }
    }

    /// Drain every queued step, then stop.
    ///
    /// Sets the shutting-down flag first so that the drained steps do not
    /// trigger rewinds. Inline mode executes the remaining steps itself;
    /// task mode hands the backlog and then the remaining steps to the
    /// simulation thread, closes the task channel and joins.
    pub fn shutdown(&mut self, marshal: &mut MarshallingManager) -> DrainReport {
        self.shutting_down.store(true, Ordering::Release);
        let mut drained_steps = 0;
        let joined = match std::mem::replace(&mut self.mode, Mode::Stopped) {
            Mode::Inline(mut runner) => {
                while let Some(push) = marshal.pop_for_drain() {
                    runner.execute(push);
                    drained_steps += 1;
                }
                self.recovered = Some(runner);
                true
            }
            Mode::Task {
                tasks,
                thread,
                in_flight,
                mut backlog,
            } => {
                if flush_backlog(&tasks, &mut backlog, true).is_err() {
                    tracing::warn!(lost = backlog.len() + 1, "backlog not delivered");
                }
                while let Some(push) = marshal.pop_for_drain() {
                    let (done, _done_rx) = bounded(1);
                    if tasks.send(StepTask { push, done }).is_err() {
                        break;
                    }
                    drained_steps += 1;
                }
                drop(in_flight);
                drop(tasks);
                match thread.join() {
                    Ok(runner) => {
                        self.recovered = Some(runner);
                        true
                    }
                    Err(_) => {
                        tracing::warn!("simulation thread panicked");
                        false
                    }
                }
            }
            Mode::Stopped => true,
        };
        self.steps_dispatched += drained_steps;
        self.phase.store(StepPhase::Idle);
        tracing::debug!(drained_steps, joined, "dispatcher drained");
        DrainReport {
            drained_steps,
            joined,
        }
    }

    /// The runner recovered by [`shutdown`](Self::shutdown), if any.
    pub(crate) fn take_runner(&mut self) -> Option<StepRunner<S>> {
        self.recovered.take()
    }

    /// Inline runner, for inspection in single-threaded mode.
    pub fn runner(&self) -> Option<&StepRunner<S>> {
        match &self.mode {
            Mode::Inline(runner) => Some(runner),
            _ => self.recovered.as_ref(),
        }
    }

    /// Length of the most recent non-zero step.
    pub fn last_step_dt(&self) -> f64 {
        self.last_step_dt
    }

    /// Producer time not yet turned into steps.
    pub fn accumulated(&self) -> f64 {
        self.accumulated
    }

    /// Steps handed to the runner so far.
    pub fn steps_dispatched(&self) -> u64 {
        self.steps_dispatched
    }

    /// Producer ticks merged into a later step.
    pub fn ticks_merged(&self) -> u64 {
        self.ticks_merged
    }
}
