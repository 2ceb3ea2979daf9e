//! # Tripwire Circuit Breaker
//!
//! Shields outbound calls to a fragile dependency. State lives in the shared
//! store behind [`tripwire_store::StateStoreAdapter`], so every instance of the
//! service sees the same breaker.
//!
//! - **Closed**: calls pass through, failures are counted
//! - **Open**: calls are rejected locally until the timeout elapses
//! - **Half-open**: a bounded number of probe calls test recovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use tripwire_breaker::{BreakerConfig, BreakerRegistry};
//!
//! let registry = BreakerRegistry::new(store, BreakerConfig::default());
//! let stripe = registry.get("stripe_api").await;
//!
//! let charge = stripe.call(client.create_charge(request)).await?;
//! ```

mod breaker;
mod config;
mod error;
mod registry;
mod state;

pub use breaker::CircuitBreaker;
pub use config::BreakerConfig;
pub use error::BreakerError;
pub use registry::BreakerRegistry;
pub use state::{CircuitState, CircuitStatus};
