//! Arena-specific error types.

use std::error::Error;
use std::fmt;

use tether_core::ProxyHandle;

/// Errors from producer-side proxy mutations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyError {
    /// The handle's slot has been despawned (and possibly reused) since
    /// the handle was minted.
    StaleHandle {
        /// The stale handle.
        handle: ProxyHandle,
        /// Generation the slot holds now.
        current_generation: u32,
    },
    /// The handle's index was never allocated by this arena.
    UnknownIndex {
        /// The unknown handle.
        handle: ProxyHandle,
    },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleHandle {
                handle,
                current_generation,
            } => {
                write!(
                    f,
                    "stale proxy handle {handle}: slot is at generation {current_generation}"
                )
            }
            Self::UnknownIndex { handle } => {
                write!(f, "proxy handle {handle} was not allocated by this arena")
            }
        }
    }
}

impl Error for ProxyError {}
