//! Core types and traits for the Tether simulation marshalling pipeline.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! vocabulary shared by the producer and simulation sides: timestamps and
//! handles, rigid-body state, the push/pull snapshot payloads, and the
//! traits implemented by the opaque simulation and its callbacks.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod callback;
pub mod error;
pub mod id;
pub mod snapshot;
pub mod state;
pub mod traits;

pub use callback::{CallbackInput, CallbackObject, SimCallback};
pub use error::SimulationError;
pub use id::{CallbackId, ExternalTimestamp, InternalStep, ProxyHandle, SimTimestamp};
pub use snapshot::{
    AggregateResult, BodyDelta, ConstraintResult, PullSnapshot, PushSnapshot, StepInfo,
};
pub use state::{ObjectState, RigidState};
pub use traits::{Poolable, RewindCallback, Simulation};

/// Re-exported math types used throughout the public API.
pub use glam::{Quat, Vec3};
