//! Delivery stage: hands a rendered notification to a channel transport,
//! applying per-worker circuit breaking and retry/dead-letter decisions.
//! The sliding rate limit (spec rule 4) is enforced earlier, in the
//! preference filter.

pub mod circuit_breaker;
pub mod transport;
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use transport::{Transport, TransportError, TransportOutcome};
pub use worker::{DeliveryConfig, DeliveryDecision, DeliveryWorker};
