//! User-facing [`Solver`] API and shutdown state machine.
//!
//! The solver owns every producer-side piece of the pipeline and wires
//! them to a [`Simulation`]:
//!
//! ```text
//! Producer (owner of Solver)
//!     |
//!     |--spawn / set_* / add_* / register_callback
//!     |     stage into the current push snapshot, update ProxyArena
//!     |
//!     |--advance(dt)
//!     |     Dispatcher: slice dt, stamp steps, run or send them
//!     |
//!     |--pull() / pull_sync()
//!     |     wait per BlockMode, ResultsManager: consume pull snapshots,
//!     |     interpolate, leash diverged objects, write ProxyArena
//!     |
//!     |--shutdown() / reset() / drop
//! ```
//!
//! # Ownership model
//!
//! `Solver` is [`Send`] but not [`Sync`]: every method takes `&self` or
//! `&mut self` on the producer thread, and a [`PullResult`] borrows the
//! solver until it is dropped.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::unbounded;
use tether_arena::{ProxyArena, ProxyError};
use tether_core::{
    BodyDelta, CallbackId, ExternalTimestamp, ObjectState, ProxyHandle, Quat, RewindCallback,
    RigidState, SimCallback, Simulation, Vec3,
};

use crate::callback::{CallbackHandle, CallbackSlot};
use crate::config::{BlockMode, ConfigError, SolverConfig};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::marshal::{link, MarshallingManager};
use crate::metrics::{PipelineMetrics, StepCounters};
use crate::results::{PullResult, ResultsManager};
use crate::step::{PhaseCell, StepPhase, StepRunner};

// Fails to compile if any field is !Send.
const _: () = {
    #[allow(dead_code)]
    fn assert_send<T: Send>() {}
    #[allow(dead_code)]
    fn check<S: Simulation>() {
        assert_send::<Solver<S>>();
    }
};

// ── ShutdownReport ────────────────────────────────────────────────

/// Report from the shutdown state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued steps executed while draining.
    pub drained_steps: u64,
    /// Total time spent in the shutdown sequence.
    pub elapsed_ms: u64,
    /// Whether the simulation thread (if any) was joined successfully.
    pub thread_joined: bool,
}

// ── ShutdownState ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    Draining,
    Dropped,
}

// ── Solver ────────────────────────────────────────────────────────

/// A simulation driven from a producer thread with interpolated results.
pub struct Solver<S: Simulation> {
    config: SolverConfig,
    marshal: MarshallingManager,
    dispatcher: Dispatcher<S>,
    results: ResultsManager,
    proxies: ProxyArena,
    counters: Arc<StepCounters>,
    phase: Arc<PhaseCell>,
    producer_time: f64,
    next_callback_id: u64,
    state: ShutdownState,
}

impl<S: Simulation> Solver<S> {
    /// Create a solver without a rewind callback.
    ///
    /// Validates `config` and, in task-thread mode, spawns the simulation
    /// thread.
    pub fn new(sim: S, config: SolverConfig) -> Result<Self, ConfigError> {
        Self::build(sim, None, config)
    }

    /// Create a solver whose simulation may rewind and replay.
    ///
    /// Rewinding needs retained push snapshots: set
    /// [`SolverConfig::rewind_history`] to the deepest rewind expected.
    pub fn with_rewind(
        sim: S,
        rewind: impl RewindCallback,
        config: SolverConfig,
    ) -> Result<Self, ConfigError> {
        Self::build(sim, Some(Box::new(rewind)), config)
    }

    fn build(
        sim: S,
        rewind: Option<Box<dyn RewindCallback>>,
        config: SolverConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (marshal, sim_link) = link(config.artificial_delay);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let phase = Arc::new(PhaseCell::default());
        let counters = Arc::new(StepCounters::default());
        let runner = StepRunner::new(
            sim,
            sim_link,
            rewind,
            config.rewind_history,
            Arc::clone(&shutting_down),
            Arc::clone(&phase),
            Arc::clone(&counters),
        );
        let dispatcher = Dispatcher::new(runner, &config, shutting_down, Arc::clone(&phase))?;

        tracing::info!(
            threading = ?config.threading,
            block_mode = ?config.block_mode,
            fixed_dt = ?config.fixed_dt,
            interpolation = config.interpolation.enabled,
            "solver started"
        );

        Ok(Self {
            results: ResultsManager::new(config.interpolation.clone()),
            config,
            marshal,
            dispatcher,
            proxies: ProxyArena::new(),
            counters,
            phase,
            producer_time: 0.0,
            next_callback_id: 0,
            state: ShutdownState::Running,
        })
    }

    // ── Objects ───────────────────────────────────────────────────

    /// Create a simulation object. It exists in the simulation from the
    /// next step on.
    pub fn spawn(&mut self, initial: RigidState) -> ProxyHandle {
        let handle = self.proxies.spawn(initial);
        self.marshal
            .get_current_push_snapshot()
            .spawned
            .push((handle, initial));
        handle
    }

    /// Remove a simulation object. `handle` is stale immediately; results
    /// still in flight for it are dropped.
    pub fn despawn(&mut self, handle: ProxyHandle) -> Result<(), ProxyError> {
        self.proxies.despawn(handle)?;
        let snap = self.marshal.get_current_push_snapshot();
        snap.bodies.shift_remove(&handle);
        snap.despawned.push(handle);
        Ok(())
    }

    /// Teleport an object.
    pub fn set_position(&mut self, handle: ProxyHandle, position: Vec3) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.position = Some(position), |s| s.position = position)
    }

    /// Set an object's orientation.
    pub fn set_rotation(&mut self, handle: ProxyHandle, rotation: Quat) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.rotation = Some(rotation), |s| s.rotation = rotation)
    }

    /// Set an object's linear velocity.
    pub fn set_linear_velocity(
        &mut self,
        handle: ProxyHandle,
        velocity: Vec3,
    ) -> Result<(), ProxyError> {
        self.edit(
            handle,
            |d| d.linear_velocity = Some(velocity),
            |s| s.linear_velocity = velocity,
        )
    }

    /// Set an object's angular velocity.
    pub fn set_angular_velocity(
        &mut self,
        handle: ProxyHandle,
        velocity: Vec3,
    ) -> Result<(), ProxyError> {
        self.edit(
            handle,
            |d| d.angular_velocity = Some(velocity),
            |s| s.angular_velocity = velocity,
        )
    }

    /// Change an object's simulation state.
    pub fn set_object_state(
        &mut self,
        handle: ProxyHandle,
        state: ObjectState,
    ) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.object_state = Some(state), |s| s.object_state = state)
    }

    /// Add a continuous force for the current producer tick.
    ///
    /// Applied on every sub-step of the tick; averaged with the other
    /// ticks merged into the same step.
    pub fn add_force(&mut self, handle: ProxyHandle, force: Vec3) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.force += force, |_| {})
    }

    /// Add a continuous torque for the current producer tick.
    pub fn add_torque(&mut self, handle: ProxyHandle, torque: Vec3) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.torque += torque, |_| {})
    }

    /// Add a one-shot linear impulse, applied on the first sub-step only.
    pub fn add_impulse(&mut self, handle: ProxyHandle, impulse: Vec3) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.linear_impulse += impulse, |_| {})
    }

    /// Add a one-shot angular impulse, applied on the first sub-step only.
    pub fn add_angular_impulse(
        &mut self,
        handle: ProxyHandle,
        impulse: Vec3,
    ) -> Result<(), ProxyError> {
        self.edit(handle, |d| d.angular_impulse += impulse, |_| {})
    }

    fn edit(
        &mut self,
        handle: ProxyHandle,
        delta: impl FnOnce(&mut BodyDelta),
        local: impl FnOnce(&mut RigidState),
    ) -> Result<(), ProxyError> {
        self.proxies.validate(handle)?;
        if let Some(state) = self.proxies.get_mut(handle) {
            local(state);
        }
        delta(self.marshal.get_current_push_snapshot().body_mut(handle));
        Ok(())
    }

    // ── Callbacks ─────────────────────────────────────────────────

    /// Register a callback. It runs from the step carrying the current
    /// push snapshot on.
    pub fn register_callback<C: SimCallback>(&mut self, callback: C) -> CallbackHandle<C> {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        let (tx, rx) = unbounded();
        self.marshal
            .get_current_push_snapshot()
            .callbacks_to_add
            .push((id, Box::new(CallbackSlot::new(id, callback, tx))));
        CallbackHandle::new(id, rx)
    }

    /// Stage the input a callback sees for every step of this tick.
    pub fn set_callback_input<C: SimCallback>(&mut self, handle: &CallbackHandle<C>, input: C::Input) {
        self.marshal
            .get_current_push_snapshot()
            .set_callback_input(handle.id(), Arc::new(input));
    }

    /// Unregister a callback before the step carrying the current push
    /// snapshot. Outputs not yet received are discarded.
    pub fn unregister_callback<C: SimCallback>(&mut self, handle: CallbackHandle<C>) {
        self.marshal
            .get_current_push_snapshot()
            .callbacks_to_remove
            .push(handle.id());
    }

    // ── Stepping ──────────────────────────────────────────────────

    /// Close the current producer tick of length `dt`.
    ///
    /// Returns the number of steps dispatched. In fixed-step mode, ticks
    /// shorter than a step are merged into a later one and return 0; a
    /// `dt` of zero flushes the accumulated remainder as a final step.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ShutDown`] after shutdown,
    /// [`DispatchError::InvalidDt`] for negative or non-finite `dt`,
    /// [`DispatchError::WorkerLost`] if the simulation thread died.
    pub fn advance(&mut self, dt: f64) -> Result<u32, DispatchError> {
        if self.state != ShutdownState::Running {
            return Err(DispatchError::ShutDown);
        }
        let dispatched = self.dispatcher.advance(&mut self.marshal, dt)?;
        self.producer_time += dt;
        Ok(dispatched)
    }

    /// Interpolated state at `producer_time - delay_steps * step_dt`.
    ///
    /// Blocks per [`SolverConfig::block_mode`] first. Falls back to
    /// [`pull_sync`](Self::pull_sync) semantics when interpolation is
    /// disabled.
    pub fn pull(&mut self) -> Result<PullResult<'_>, DispatchError> {
        self.dispatcher.wait(self.config.block_mode)?;
        if !self.config.interpolation.enabled {
            return Ok(self.results.pull_sync(&mut self.marshal, &mut self.proxies));
        }
        let query = self.query_time();
        Ok(self
            .results
            .pull_async(&mut self.marshal, &mut self.proxies, query))
    }

    /// Latest state, without interpolation, after every dispatched step
    /// completed.
    pub fn pull_sync(&mut self) -> Result<PullResult<'_>, DispatchError> {
        self.dispatcher.wait(BlockMode::BlockOnLatest)?;
        Ok(self.results.pull_sync(&mut self.marshal, &mut self.proxies))
    }

    /// Query time the next interpolated pull will use.
    pub fn query_time(&self) -> f64 {
        self.producer_time - self.config.interpolation.delay_steps * self.dispatcher.last_step_dt()
    }

    // ── Inspection ────────────────────────────────────────────────

    /// Last presented state of an object; `None` for stale handles.
    pub fn state(&self, handle: ProxyHandle) -> Option<&RigidState> {
        self.proxies.get(handle)
    }

    /// Leash progress of a diverged object at the current query time.
    pub fn leash_factor(&self, handle: ProxyHandle) -> Option<f64> {
        self.results.leash_factor(handle, self.query_time())
    }

    /// Producer-side proxy registry.
    pub fn proxies(&self) -> &ProxyArena {
        &self.proxies
    }

    /// The simulation, when it is not on the simulation thread
    /// (single-threaded mode, or after shutdown).
    pub fn simulation(&self) -> Option<&S> {
        self.dispatcher.runner().map(StepRunner::simulation)
    }

    /// Pipeline counters.
    pub fn metrics(&self) -> PipelineMetrics {
        let mut m = PipelineMetrics::default();
        self.counters.fill(&mut m);
        self.results.fill(&mut m);
        m.steps_dispatched = self.dispatcher.steps_dispatched();
        m.ticks_merged = self.dispatcher.ticks_merged();
        m.push_backing_allocations = self.marshal.push_backing_allocations() as u64;
        m
    }

    /// Most recent step pipeline transition.
    pub fn phase(&self) -> StepPhase {
        self.phase.load()
    }

    /// Timestamp the next dispatched producer tick will carry.
    pub fn external_timestamp(&self) -> ExternalTimestamp {
        self.marshal.external_timestamp()
    }

    /// Sum of every `dt` passed to [`advance`](Self::advance).
    pub fn producer_time(&self) -> f64 {
        self.producer_time
    }

    /// The active configuration.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Drain every queued step and stop.
    ///
    /// 1. **Running → Draining:** set the shutting-down flag (suppresses
    ///    rewinds), run the remaining queued steps, ignoring any
    ///    artificial delay.
    /// 2. **Draining → Dropped:** join the simulation thread.
    ///
    /// Results of the drained steps remain available to
    /// [`pull_sync`](Self::pull_sync).
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.state == ShutdownState::Dropped {
            return ShutdownReport {
                drained_steps: 0,
                elapsed_ms: 0,
                thread_joined: true,
            };
        }

        let start = Instant::now();
        self.state = ShutdownState::Draining;
        let drain = self.dispatcher.shutdown(&mut self.marshal);
        self.state = ShutdownState::Dropped;

        let report = ShutdownReport {
            drained_steps: drain.drained_steps,
            elapsed_ms: start.elapsed().as_millis() as u64,
            thread_joined: drain.joined,
        };
        tracing::info!(
            drained_steps = report.drained_steps,
            elapsed_ms = report.elapsed_ms,
            thread_joined = report.thread_joined,
            "solver shut down"
        );
        report
    }

    /// Start a new episode: stop, reset the simulation, restart.
    ///
    /// Queued steps are drained first. Afterwards every proxy handle is
    /// stale, callbacks are unregistered, timestamps start from zero and
    /// metrics are cleared.
    pub fn reset(&mut self) -> Result<(), ConfigError> {
        if self.state != ShutdownState::Dropped {
            self.shutdown();
        }

        let mut runner = self
            .dispatcher
            .take_runner()
            .ok_or(ConfigError::RunnerRecoveryFailed)?;
        runner.reset();

        self.results.clear(&self.marshal);
        let (marshal, sim_link) = link(self.config.artificial_delay);
        let shutting_down = Arc::new(AtomicBool::new(false));
        self.counters = Arc::new(StepCounters::default());
        runner.relink(sim_link, Arc::clone(&shutting_down), Arc::clone(&self.counters));

        self.dispatcher = Dispatcher::new(runner, &self.config, shutting_down, Arc::clone(&self.phase))?;
        self.marshal = marshal;
        self.results = ResultsManager::new(self.config.interpolation.clone());
        self.proxies.clear();
        self.producer_time = 0.0;
        self.phase.store(StepPhase::Idle);
        self.state = ShutdownState::Running;
        tracing::debug!("solver reset");
        Ok(())
    }
}

impl<S: Simulation> Drop for Solver<S> {
    fn drop(&mut self) {
        if self.state != ShutdownState::Dropped {
            self.shutdown();
        }
    }
}
