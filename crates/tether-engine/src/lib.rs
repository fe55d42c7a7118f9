//! Marshalling, step dispatch and result interpolation for Tether.
//!
//! A producer thread stages object edits and callback inputs into push
//! snapshots and closes one producer tick at a time. The dispatcher turns
//! ticks into simulation steps, runs them inline or on a dedicated
//! simulation thread, and the simulation side answers with pull snapshots.
//! The results manager blends consecutive pull snapshots for the
//! producer's query time and leashes objects whose replayed results
//! diverged from what was already shown.
//!
//! Most users only need [`Solver`] and [`SolverConfig`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod callback;
pub mod config;
pub mod dispatch;
pub mod divergence;
pub mod marshal;
pub mod metrics;
pub mod results;
pub mod solver;
pub mod step;

pub use callback::{CallbackHandle, CallbackOutput};
pub use config::{BlockMode, ConfigError, InterpolationConfig, SolverConfig, ThreadingMode};
pub use dispatch::{DispatchError, Dispatcher, DrainReport};
pub use divergence::DivergenceTracker;
pub use marshal::{link, MarshallingManager, SimLink};
pub use metrics::PipelineMetrics;
pub use results::{PullResult, ResultsManager};
pub use solver::{ShutdownReport, Solver};
pub use step::{StepPhase, StepRunner};
