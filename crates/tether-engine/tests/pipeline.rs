//! Integration test: producer → simulation → producer scenarios through
//! the public `Solver` API.
//!
//! Covers sub-step determinism, callback lifecycle, force averaging,
//! both block modes on the simulation thread, shutdown draining, stale
//! proxies, and divergence reconciliation after a scripted rewind.

use std::sync::atomic::Ordering;

use tether_core::{InternalStep, ProxyHandle, RigidState, Vec3};
use tether_engine::{BlockMode, InterpolationConfig, Solver, SolverConfig, ThreadingMode};
use tether_test_utils::{BallisticSim, RecordingCallback, ScriptedRewind};

fn moving(x: f32) -> RigidState {
    let mut s = RigidState::dynamic_at(Vec3::new(x, 0.0, 0.0));
    s.linear_velocity = Vec3::X;
    s
}

// ── Sub-steps ────────────────────────────────────────────────────────

#[test]
fn callback_sees_every_substep_with_same_input() {
    let config = SolverConfig {
        max_step_dt: Some(0.1),
        max_substeps: 4,
        ..Default::default()
    };
    let sim = BallisticSim::new();
    let steps = sim.log();
    let mut solver = Solver::new(sim, config).unwrap();
    let h = solver.spawn(RigidState::dynamic_at(Vec3::ZERO));

    let cb = RecordingCallback::<u32>::new();
    let seen = cb.observations();
    let handle = solver.register_callback(cb);
    solver.set_callback_input(&handle, 7);
    solver.add_impulse(h, Vec3::Y).unwrap();

    assert_eq!(solver.advance(0.3).unwrap(), 3);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for (i, (info, input)) in seen.iter().enumerate() {
        assert!((info.dt - 0.1).abs() < 1e-12);
        assert_eq!(info.step, i as u32);
        assert_eq!(info.num_steps, 3);
        assert_eq!(*input, Some(7));
    }

    // One-shot data only on the first sub-step.
    let steps = steps.lock().unwrap().clone();
    let impulses: Vec<usize> = steps.iter().map(|s| s.impulses).collect();
    assert_eq!(impulses, vec![1, 0, 0]);
    let spawned: Vec<usize> = steps.iter().map(|s| s.spawned).collect();
    assert_eq!(spawned, vec![1, 0, 0]);

    let outputs = handle.drain();
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|o| o.external_timestamp.0 == 0 && !o.resim));
}

#[test]
fn unregistered_callback_stops_running() {
    let mut solver = Solver::new(BallisticSim::new(), SolverConfig::default()).unwrap();
    let cb = RecordingCallback::<()>::new();
    let seen = cb.observations();
    let removed = cb.removed_flag();
    let handle = solver.register_callback(cb);

    solver.advance(0.1).unwrap();
    solver.advance(0.1).unwrap();
    solver.unregister_callback(handle);
    solver.advance(0.1).unwrap();
    solver.advance(0.1).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert!(removed.load(Ordering::Acquire));
}

#[test]
fn merged_ticks_average_forces() {
    let config = SolverConfig {
        fixed_dt: Some(0.1),
        ..Default::default()
    };
    let sim = BallisticSim::new();
    let steps = sim.log();
    let mut solver = Solver::new(sim, config).unwrap();
    let h = solver.spawn(RigidState::dynamic_at(Vec3::ZERO));

    solver.add_force(h, Vec3::X).unwrap();
    assert_eq!(solver.advance(0.05).unwrap(), 0);
    solver.add_force(h, Vec3::X).unwrap();
    assert_eq!(solver.advance(0.05).unwrap(), 1);

    assert_eq!(steps.lock().unwrap()[0].producer_ticks, 2);
    // Two unit forces averaged over two ticks: one unit for 0.1.
    let body = solver.simulation().unwrap().body(h).unwrap();
    assert!((body.linear_velocity.x - 0.1).abs() < 1e-6);
    assert_eq!(solver.metrics().ticks_merged, 1);
}

// ── Block modes ──────────────────────────────────────────────────────

fn run_task_thread(block_mode: BlockMode) -> (u64, u64) {
    let config = SolverConfig {
        threading: ThreadingMode::TaskThread,
        block_mode,
        fixed_dt: Some(1.0 / 60.0),
        ..Default::default()
    };
    let mut solver = Solver::new(BallisticSim::new(), config).unwrap();
    let h = solver.spawn(moving(0.0));
    for _ in 0..30 {
        solver.advance(1.0 / 60.0).unwrap();
        let result = solver.pull().unwrap();
        assert!(result.state(h).is_some());
        assert!((0.0..=1.0).contains(&result.alpha()));
    }
    let m = solver.metrics();
    (m.steps_dispatched, m.steps_completed)
}

#[test]
fn block_on_latest_waits_for_every_step() {
    let (dispatched, completed) = run_task_thread(BlockMode::BlockOnLatest);
    assert_eq!(dispatched, 30);
    assert_eq!(completed, 30);
}

#[test]
fn block_on_second_latest_lags_at_most_one_step() {
    let (dispatched, completed) = run_task_thread(BlockMode::BlockOnSecondLatest);
    assert_eq!(dispatched, 30);
    assert!(completed >= 29, "completed {completed}");
}

// ── Shutdown ─────────────────────────────────────────────────────────

#[test]
fn shutdown_drains_steps_held_by_artificial_delay() {
    for threading in [ThreadingMode::SingleThreaded, ThreadingMode::TaskThread] {
        let config = SolverConfig {
            threading,
            artificial_delay: 3,
            ..Default::default()
        };
        let mut solver = Solver::new(BallisticSim::new(), config).unwrap();
        let h = solver.spawn(moving(0.0));
        for _ in 0..5 {
            solver.advance(0.1).unwrap();
        }
        let report = solver.shutdown();
        assert_eq!(report.drained_steps, 3);
        assert!(report.thread_joined);

        let result = solver.pull_sync().unwrap();
        assert_eq!(result.next().unwrap().internal_step, InternalStep(4));
        let x = result.state(h).unwrap().position.x;
        assert!((x - 0.5).abs() < 1e-5, "x = {x}");
        assert_eq!(solver.metrics().steps_completed, 5);
    }
}

// ── Stale proxies ────────────────────────────────────────────────────

#[test]
fn results_for_despawned_proxy_are_dropped() {
    let mut solver = Solver::new(BallisticSim::new(), SolverConfig::default()).unwrap();
    let h = solver.spawn(moving(0.0));
    solver.advance(0.1).unwrap();
    solver.despawn(h).unwrap();
    let replacement = solver.spawn(moving(5.0));
    assert_eq!(replacement.index(), h.index());

    let result = solver.pull_sync().unwrap();
    assert!(result.state(h).is_none());
    assert_eq!(result.state(replacement).unwrap().position.x, 5.0);
    assert_eq!(solver.metrics().stale_results_dropped, 1);

    // The simulation forgets the body once the despawn is marshalled.
    solver.advance(0.1).unwrap();
    let sim = solver.simulation().unwrap();
    assert!(sim.body(h).is_none());
    assert!(sim.body(ProxyHandle::new(h.index(), h.generation() + 1)).is_some());
}

// ── Resimulation ─────────────────────────────────────────────────────

#[test]
fn rewind_divergence_is_leashed_then_retired() {
    let config = SolverConfig {
        fixed_dt: Some(0.1),
        rewind_history: 8,
        interpolation: InterpolationConfig {
            resim_time_constant: 1.0,
            resim_strength: 0.2,
            ..Default::default()
        },
        ..Default::default()
    };
    let sim = BallisticSim::new().with_resim_nudge(Vec3::new(0.0, 0.5, 0.0));
    let rewind = ScriptedRewind::new([(InternalStep(5), InternalStep(3))]);
    let mut solver = Solver::with_rewind(sim, rewind, config).unwrap();
    let h = solver.spawn(moving(0.0));

    let mut leash = Vec::new();
    for _ in 0..40 {
        solver.advance(0.1).unwrap();
        let y = solver.pull().unwrap().state(h).unwrap().position.y;
        assert!(y.is_finite());
        if let Some(f) = solver.leash_factor(h) {
            leash.push(f);
        }
    }

    let m = solver.metrics();
    assert_eq!(m.resim_steps, 3);
    assert_eq!(m.resim_results, 3);
    assert_eq!(m.divergences_detected, 1);
    assert_eq!(m.divergences_retired, 1);
    assert!(!leash.is_empty());
    assert!(leash.windows(2).all(|w| w[0] <= w[1]));
    assert!(solver.leash_factor(h).is_none());

    // After the leash ran out the presented pose follows the replayed run.
    let y = solver.state(h).unwrap().position.y;
    assert!((y - 1.5).abs() < 1e-4, "y = {y}");
}
