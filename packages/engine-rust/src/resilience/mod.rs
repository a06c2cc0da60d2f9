//! Resilient execution of fallible async operations.

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;

pub use backoff::{backoff_delay, base_delay_for};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retry::{RetryExecutor, RetryOutcome};
