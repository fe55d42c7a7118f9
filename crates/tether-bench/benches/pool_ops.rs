//! Criterion micro-benchmarks for snapshot pool reuse and the marshal round trip.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tether_arena::SnapshotPool;
use tether_core::{ProxyHandle, PullSnapshot, PushSnapshot, RigidState, Vec3};
use tether_engine::link;

/// Benchmark: alloc then free a push snapshot carrying 1K body deltas.
fn bench_pool_alloc_free_1k(c: &mut Criterion) {
    let mut pool: SnapshotPool<PushSnapshot> = SnapshotPool::new("bench-push");
    c.bench_function("pool_alloc_free_1k", |b| {
        b.iter(|| {
            let mut snap = pool.alloc();
            for i in 0..1_000u32 {
                snap.body_mut(ProxyHandle::new(i, 0)).force = Vec3::Y;
            }
            black_box(snap.bodies.len());
            pool.free(snap);
        });
    });
}

/// Benchmark: return pull snapshots through a recycler and pick them up on alloc.
fn bench_recycler_round_trip(c: &mut Criterion) {
    let mut pool: SnapshotPool<PullSnapshot> = SnapshotPool::new("bench-pull");
    let recycler = pool.recycler();
    c.bench_function("recycler_round_trip", |b| {
        b.iter(|| {
            let mut snap = pool.alloc();
            for i in 0..256u32 {
                snap.push_rigid(ProxyHandle::new(i, 0), RigidState::default());
            }
            recycler.recycle(snap);
        });
    });
    black_box(pool.backing_allocations());
}

/// Benchmark: one producer tick through the marshal, consumed by the simulation side.
fn bench_marshal_tick(c: &mut Criterion) {
    let (mut marshal, mut sim) = link(0);
    c.bench_function("marshal_tick_4_steps", |b| {
        b.iter(|| {
            for i in 0..64u32 {
                marshal.get_current_push_snapshot().body_mut(ProxyHandle::new(i, 0)).force = Vec3::X;
            }
            marshal.advance_external(1.0 / 60.0, 4).unwrap();
            while let Some(push) = marshal.pop_next_internal_step() {
                let mut pull = sim.alloc_pull_snapshot();
                pull.internal_step = push.internal_step;
                sim.publish(pull);
                sim.free_push_snapshot(push);
            }
            while let Some(pull) = marshal.pop_pull_snapshot() {
                black_box(pull.internal_step);
                marshal.free_pull_snapshot(pull);
            }
        });
    });
}

criterion_group!(
    benches,
    bench_pool_alloc_free_1k,
    bench_recycler_round_trip,
    bench_marshal_tick
);
criterion_main!(benches);
