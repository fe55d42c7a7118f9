//! Strongly-typed timestamps, step counters, and handles.

use std::fmt;

/// Monotonic producer-side tick identity.
///
/// Incremented by exactly one per `advance_external` call, regardless of
/// how many simulation steps that call was sliced into. All sub-steps of
/// one producer tick share the same external timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalTimestamp(pub u64);

impl ExternalTimestamp {
    /// The following timestamp.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ExternalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ExternalTimestamp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Monotonic simulation-side result identity.
///
/// Assigned by the step runner each time a pull snapshot is published.
/// Independent of [`ExternalTimestamp`]: resimulated steps receive fresh,
/// larger sim timestamps even though they cover already-delivered time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimTimestamp(pub u64);

impl fmt::Display for SimTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SimTimestamp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Index of a simulation step.
///
/// Every push snapshot is stamped with the internal step it was produced
/// for; rewinds address steps by this index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalStep(pub u64);

impl fmt::Display for InternalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InternalStep {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a registered simulation callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation-counted reference to a simulation object.
///
/// The producer never holds a pointer into simulation state. It holds a
/// slot index plus the generation the slot had when the proxy was
/// spawned. Despawning bumps the slot generation, so every handle minted
/// before the despawn (including the ones embedded in in-flight pull
/// results) resolves to "absent" from then on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct ProxyHandle {
    index: u32,
    generation: u32,
}

impl ProxyHandle {
    /// Create a handle from its raw parts.
    ///
    /// Normally only the proxy arena mints handles; this is public so
    /// tests and simulations can build fixtures.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the proxy arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was minted.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({}v{})", self.index, self.generation)
    }
}
