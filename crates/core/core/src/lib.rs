//! # Tripwire Core
//!
//! Foundational seams shared by every Tripwire crate: a [`Clock`] so that
//! time-driven state machines can be tested deterministically, and an
//! [`Alerter`] through which breaker trips and exhausted webhook retries reach
//! whatever paging channel the host application uses.

pub mod alert;
pub mod clock;

pub use alert::{Alert, AlertLevel, Alerter, MemoryAlerter, NoopAlerter, TracingAlerter};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
