//! Error types shared across the pipeline.

use std::error::Error;
use std::fmt;

use crate::id::{InternalStep, ProxyHandle};

/// Errors from the opaque simulation-advance operation.
///
/// A failed step publishes no results. The pipeline logs the failure,
/// counts it, and keeps going: the producer sees the last good results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimulationError {
    /// The step could not be computed.
    ExecutionFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// A push snapshot referenced an object the simulation does not know.
    UnknownProxy {
        /// The unknown handle.
        handle: ProxyHandle,
    },
    /// Integration produced a non-finite value.
    NonFinite {
        /// The object whose state blew up.
        handle: ProxyHandle,
        /// Step at which it happened.
        step: InternalStep,
    },
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionFailed { reason } => write!(f, "simulation step failed: {reason}"),
            Self::UnknownProxy { handle } => write!(f, "unknown proxy {handle}"),
            Self::NonFinite { handle, step } => {
                write!(f, "non-finite state for {handle} at step {step}")
            }
        }
    }
}

impl Error for SimulationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_proxy() {
        let err = SimulationError::NonFinite {
            handle: ProxyHandle::new(4, 2),
            step: InternalStep(9),
        };
        assert_eq!(err.to_string(), "non-finite state for Proxy(4v2) at step 9");
    }
}
