//! Rigid-body state exchanged between the two sides of the pipeline.

use glam::{Quat, Vec3};

/// Simulation state of a rigid object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Created on the producer side, not yet seen by the simulation.
    #[default]
    Uninitialized,
    /// Asleep: not integrated until woken.
    Sleeping,
    /// Moved by the producer, not by forces.
    Kinematic,
    /// Never moves.
    Static,
    /// Fully simulated.
    Dynamic,
}

/// Pose, velocities and state of one rigid object at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidState {
    /// World-space position.
    pub position: Vec3,
    /// World-space orientation. Kept normalized.
    pub rotation: Quat,
    /// Linear velocity.
    pub linear_velocity: Vec3,
    /// Angular velocity.
    pub angular_velocity: Vec3,
    /// Simulation state enum.
    pub object_state: ObjectState,
}

impl Default for RigidState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            object_state: ObjectState::Uninitialized,
        }
    }
}

impl RigidState {
    /// A dynamic body at rest at `position`.
    pub fn dynamic_at(position: Vec3) -> Self {
        Self {
            position,
            object_state: ObjectState::Dynamic,
            ..Self::default()
        }
    }

    /// Blend from `self` toward `other`.
    ///
    /// Position and velocities are interpolated linearly, rotation uses a
    /// normalized spherical blend. `alpha` is clamped to `[0, 1]`. The
    /// object state is taken from `other` once any progress is made.
    pub fn interpolate(&self, other: &RigidState, alpha: f32) -> RigidState {
        let alpha = alpha.clamp(0.0, 1.0);
        if alpha <= 0.0 {
            return *self;
        }
        if alpha >= 1.0 {
            return *other;
        }
        RigidState {
            position: self.position.lerp(other.position, alpha),
            rotation: self.rotation.slerp(other.rotation, alpha).normalize(),
            linear_velocity: self.linear_velocity.lerp(other.linear_velocity, alpha),
            angular_velocity: self.angular_velocity.lerp(other.angular_velocity, alpha),
            object_state: other.object_state,
        }
    }

    /// Exact, bit-for-bit comparison.
    ///
    /// Resimulation divergence is decided on this, not on `PartialEq`:
    /// `-0.0 == 0.0` and `NaN != NaN` under float equality, and neither
    /// answer is what "did the replay reproduce the original" means.
    pub fn bitwise_eq(&self, other: &RigidState) -> bool {
        fn bits3(v: Vec3) -> [u32; 3] {
            v.to_array().map(f32::to_bits)
        }
        bits3(self.position) == bits3(other.position)
            && self.rotation.to_array().map(f32::to_bits)
                == other.rotation.to_array().map(f32::to_bits)
            && bits3(self.linear_velocity) == bits3(other.linear_velocity)
            && bits3(self.angular_velocity) == bits3(other.angular_velocity)
            && self.object_state == other.object_state
    }

    /// Whether every float component is finite.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.rotation.is_finite()
            && self.linear_velocity.is_finite()
            && self.angular_velocity.is_finite()
    }
}
