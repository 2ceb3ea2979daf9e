//! # Tripwire State Store
//!
//! The only shared mutable resource in Tripwire sits behind this crate:
//! - [`StateStore`] - the narrow verb set (atomic increment, get, set with expiry)
//! - [`MemoryStateStore`] - process-local backend
//! - [`RedisStateStore`] - distributed backend (feature `redis-backend`)
//! - [`StateStoreAdapter`] - wraps a shared backend with a local fallback and
//!   reports every result as [`StoreOutcome::Healthy`] or [`StoreOutcome::Degraded`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use tripwire_store::StateStoreAdapter;
//! use std::time::Duration;
//!
//! let timeout = Duration::from_secs(2);
//! let store = StateStoreAdapter::connect("redis://localhost:6379", "tripwire", timeout).await;
//! let failures = store
//!     .incr_with_expiry("circuit_breaker:stripe_api:failures", Duration::from_secs(120))
//!     .await;
//! if failures.is_degraded() {
//!     // served from local memory
//! }
//! ```

mod adapter;
mod error;
mod memory;
mod outcome;
#[cfg(feature = "redis-backend")]
mod redis_store;
mod store;

pub use adapter::StateStoreAdapter;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStateStore;
pub use outcome::StoreOutcome;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStateStore;
pub use store::StateStore;
