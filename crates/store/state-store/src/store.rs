//! The state store trait.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::StoreResult;

/// Narrow key/value verb set every backend must provide.
///
/// Values are strings; callers own their encoding. `incr_with_expiry` must be
/// atomic with respect to other instances sharing the backend.
#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    /// Short backend name for logs (`memory`, `redis`).
    fn backend(&self) -> &'static str;

    /// Atomically increments the integer at `key` (missing counts as 0) and
    /// refreshes its expiry to `ttl`. Returns the new value.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Reads `key`. Expired keys read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `key` without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Writes `key`, expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;
}
