//! Resimulation divergence reconciliation.
//!
//! When a replayed result disagrees with what the producer already saw
//! for the same step, the object is not snapped to the corrected state.
//! It is leashed instead: each pull moves its rendered pose a fixed
//! fraction (`strength`) of the remaining distance toward the corrected
//! interpolation, for `time_constant` units of producer time. After that
//! the record is retired and plain interpolation takes over.

use indexmap::IndexMap;
use tether_core::{ProxyHandle, RigidState};

#[derive(Clone, Copy, Debug)]
struct DivergenceRecord {
    start_time: f64,
    /// Pose presented on the last pull.
    rendered: RigidState,
}

/// Per-object divergence records.
#[derive(Debug)]
pub struct DivergenceTracker {
    records: IndexMap<ProxyHandle, DivergenceRecord>,
    time_constant: f64,
    strength: f32,
    detected: u64,
    retired: u64,
}

impl DivergenceTracker {
    /// A tracker with the given leash tunables.
    ///
    /// A non-positive `time_constant` disables leashing: corrected states
    /// are snapped to immediately.
    pub fn new(time_constant: f64, strength: f32) -> Self {
        Self {
            records: IndexMap::new(),
            time_constant,
            strength: strength.clamp(0.0, 1.0),
            detected: 0,
            retired: 0,
        }
    }

    /// Compare a replayed result against the originally delivered one.
    ///
    /// `original` is `None` when the object was not part of the original
    /// result, which counts as diverged. `rendered` is the pose the
    /// producer currently sees. An exact match clears any record. Returns
    /// whether the object is now diverged.
    pub fn observe(
        &mut self,
        handle: ProxyHandle,
        original: Option<&RigidState>,
        replayed: &RigidState,
        now: f64,
        rendered: RigidState,
    ) -> bool {
        let diverged = original.is_none_or(|o| !o.bitwise_eq(replayed));
        if !diverged {
            if self.records.shift_remove(&handle).is_some() {
                tracing::debug!(proxy = %handle, "divergence cleared by matching replay");
            }
            return false;
        }
        if !self.records.contains_key(&handle) {
            tracing::debug!(proxy = %handle, start = now, "divergence detected");
            self.detected += 1;
            self.records.insert(
                handle,
                DivergenceRecord {
                    start_time: now,
                    rendered,
                },
            );
        }
        true
    }

    /// Progress of the leash for `handle` at `query_time`, in `[0, 1]`.
    ///
    /// `None` when the object is not diverged.
    pub fn leash_factor(&self, handle: ProxyHandle, query_time: f64) -> Option<f64> {
        let record = self.records.get(&handle)?;
        if self.time_constant <= 0.0 {
            return Some(1.0);
        }
        Some(((query_time - record.start_time) / self.time_constant).clamp(0.0, 1.0))
    }

    /// Pose to present for `handle` given its plain interpolation `base`.
    ///
    /// Retires the record once the leash factor reaches 1.
    pub fn apply(&mut self, handle: ProxyHandle, base: RigidState, query_time: f64) -> RigidState {
        let Some(factor) = self.leash_factor(handle, query_time) else {
            return base;
        };
        if factor >= 1.0 {
            self.records.shift_remove(&handle);
            self.retired += 1;
            tracing::debug!(proxy = %handle, "divergence retired");
            return base;
        }
        let strength = self.strength;
        match self.records.get_mut(&handle) {
            Some(record) => {
                let out = record.rendered.interpolate(&base, strength);
                record.rendered = out;
                out
            }
            None => base,
        }
    }

    /// Drop the record for a despawned object.
    pub fn forget(&mut self, handle: ProxyHandle) {
        self.records.shift_remove(&handle);
    }

    /// Drop every record. Affected objects snap to their current state.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Whether `handle` is diverged.
    pub fn contains(&self, handle: ProxyHandle) -> bool {
        self.records.contains_key(&handle)
    }

    /// Number of diverged objects.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no object is diverged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Divergences detected so far.
    pub fn detected(&self) -> u64 {
        self.detected
    }

    /// Divergences whose leash ran out.
    pub fn retired(&self) -> u64 {
        self.retired
    }
}
