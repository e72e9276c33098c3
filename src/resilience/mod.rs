//! Resilience policies applied around fallible async operations
//!
//! [`RetryPolicy`] and [`CircuitBreaker`] wrap a closure producing a future and
//! know nothing about what it does. Errors describe themselves through
//! [`Classify`].

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerStatus, CircuitBreaker};
pub use retry::{RetryError, RetryPolicy};

/// How a policy should treat an error
pub trait Classify {
    /// Trying again may succeed
    fn is_retryable(&self) -> bool;

    /// Counts toward opening a circuit breaker.
    ///
    /// Caller mistakes (bad input, conflicts) return `false` so that they
    /// cannot take the protected operation offline.
    fn is_failure(&self) -> bool {
        true
    }
}
