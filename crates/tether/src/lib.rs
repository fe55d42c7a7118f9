//! Tether: marshal edits into a physics simulation and interpolate its
//! results back for rendering.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Tether sub-crates. For most users, adding `tether` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use tether::prelude::*;
//!
//! // A simulation that moves every body by its velocity.
//! #[derive(Default)]
//! struct Drift {
//!     bodies: Vec<(ProxyHandle, RigidState)>,
//! }
//!
//! impl Simulation for Drift {
//!     fn advance(&mut self, push: &PushSnapshot, step: &StepInfo) -> Result<(), SimulationError> {
//!         self.bodies.extend(push.spawned.iter().copied());
//!         for (_, body) in &mut self.bodies {
//!             body.position += body.linear_velocity * step.dt as f32;
//!         }
//!         Ok(())
//!     }
//!     fn buffer_results(&mut self, out: &mut PullSnapshot) {
//!         for (handle, body) in &self.bodies {
//!             out.push_rigid(*handle, *body);
//!         }
//!     }
//! }
//!
//! let mut solver = Solver::new(Drift::default(), SolverConfig::default()).unwrap();
//! let mut ball = RigidState::dynamic_at(Vec3::ZERO);
//! ball.linear_velocity = Vec3::X;
//! let h = solver.spawn(ball);
//!
//! solver.advance(0.5).unwrap();
//! let result = solver.pull_sync().unwrap();
//! assert_eq!(result.state(h).unwrap().position, Vec3::new(0.5, 0.0, 0.0));
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tether-core` | Ids, rigid state, snapshots, simulation traits |
//! | [`arena`] | `tether-arena` | Snapshot pools and the proxy arena |
//! | [`engine`] | `tether-engine` | Marshalling, dispatch, results and the solver |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and ids (`tether-core`).
///
/// Contains [`types::PushSnapshot`], [`types::PullSnapshot`], the
/// [`types::Simulation`] trait and the callback traits.
pub use tether_core as types;

/// Snapshot pools and proxy slots (`tether-arena`).
///
/// Most users never touch these directly; the solver owns them.
pub use tether_arena as arena;

/// The marshalling pipeline (`tether-engine`).
///
/// [`engine::Solver`] drives everything; [`engine::MarshallingManager`]
/// and [`engine::ResultsManager`] are exposed for custom pipelines.
pub use tether_engine as engine;

/// Common imports for typical Tether usage.
///
/// ```rust
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use tether_core::{
        ExternalTimestamp, InternalStep, ObjectState, ProxyHandle, PullSnapshot, PushSnapshot,
        Quat, RewindCallback, RigidState, SimCallback, Simulation, StepInfo, Vec3,
    };

    // Errors
    pub use tether_arena::ProxyError;
    pub use tether_core::SimulationError;
    pub use tether_engine::{ConfigError, DispatchError};

    // Engine
    pub use tether_engine::{
        BlockMode, CallbackHandle, CallbackOutput, InterpolationConfig, PipelineMetrics,
        PullResult, ShutdownReport, Solver, SolverConfig, ThreadingMode,
    };
}
