//! # Raffle Runtime
//!
//! Resilience and observability building blocks shared by the engine.
//!
//! - [`retry`]: bounded retry with geometric backoff for transient failures
//! - [`circuit_breaker`]: rolling-window breaker driven by an injected clock
//! - [`metrics`]: Prometheus recorder and scrape endpoint
//!
//! Nothing here knows about tickets or sales. The engine wraps its payment
//! gateway client with these pieces.

/// Retry logic with increasing backoff
pub mod retry;

/// Circuit breaker for protecting a failing dependency
pub mod circuit_breaker;

/// Prometheus metrics exporter
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
pub use retry::{RetryPolicy, retry_with_predicate};
