//! Outcome of an adapter operation.

/// Where a value returned by [`crate::StateStoreAdapter`] came from.
///
/// `Healthy` values come from the configured store (shared when one is
/// configured). `Degraded` values were served from process-local memory
/// because the shared store failed; callers decide what that means for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome<T> {
    /// Served by the configured store.
    Healthy(T),
    /// Served by the local fallback after the shared store failed.
    Degraded(T),
}

impl<T> StoreOutcome<T> {
    /// Returns true if the value came from the local fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(self, StoreOutcome::Degraded(_))
    }

    /// Borrows the value regardless of its source.
    pub fn value(&self) -> &T {
        match self {
            StoreOutcome::Healthy(v) | StoreOutcome::Degraded(v) => v,
        }
    }

    /// Unwraps the value regardless of its source.
    pub fn into_inner(self) -> T {
        match self {
            StoreOutcome::Healthy(v) | StoreOutcome::Degraded(v) => v,
        }
    }

    /// Maps the value, keeping the source.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StoreOutcome<U> {
        match self {
            StoreOutcome::Healthy(v) => StoreOutcome::Healthy(f(v)),
            StoreOutcome::Degraded(v) => StoreOutcome::Degraded(f(v)),
        }
    }

    /// Returns true if both outcomes came from the same source.
    pub fn same_source<U>(&self, other: &StoreOutcome<U>) -> bool {
        self.is_degraded() == other.is_degraded()
    }
}
