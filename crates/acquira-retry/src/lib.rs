//! Retry engine: exponential backoff with jitter, per-PSP circuit breakers,
//! and the dead-letter queue for exhausted transactions.

pub mod backoff;
pub mod breaker;
pub mod dlq;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitSnapshot, CircuitState};
pub use dlq::DeadLetterQueue;
