//! Rolling-window circuit breaker.
//!
//! The breaker keeps the timestamps of recent failures. Once the number of
//! failures inside [`CircuitBreakerConfig::window`] reaches
//! [`CircuitBreakerConfig::failure_threshold`], it opens for
//! [`CircuitBreakerConfig::cooldown`] and every call short-circuits with
//! [`CircuitBreakerError::Open`] without touching the protected dependency.
//!
//! Time is read through an injected [`Clock`], so the whole state machine can
//! be driven deterministically in tests.
//!
//! # States
//!
//! - **Closed**: calls pass through, failures are recorded in the window.
//! - **Open**: calls are rejected until the cooldown elapses.
//! - **HalfOpen**: calls pass through as probes. Enough successes close the
//!   breaker; a single failure reopens it.
//!
//! # Example
//!
//! ```rust
//! use raffle_core::environment::SystemClock;
//! use raffle_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(3)
//!     .window(Duration::from_secs(120))
//!     .cooldown(Duration::from_secs(60))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("gateway", config, Arc::new(SystemClock));
//! let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert!(result.is_ok());
//! # }
//! ```

use chrono::{DateTime, Utc};
use raffle_core::environment::Clock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the breaker
    pub failure_threshold: usize,
    /// Length of the rolling failure window
    pub window: Duration,
    /// How long the breaker stays open before probing
    pub cooldown: Duration,
    /// Probe successes required in `HalfOpen` to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            window: None,
            cooldown: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    window: Option<Duration>,
    cooldown: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the number of failures in the window that opens the breaker.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the rolling window length.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Set how long the breaker stays open.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set the probe successes needed to close from `HalfOpen`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold).max(1),
            window: self.window.unwrap_or(defaults.window),
            cooldown: self.cooldown.unwrap_or(defaults.cooldown),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// Calls pass through as recovery probes
    HalfOpen,
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Breaker is open, the operation was not attempted
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    failures: VecDeque<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    probe_successes: usize,
}

impl BreakerState {
    const fn closed() -> Self {
        Self {
            state: State::Closed,
            failures: VecDeque::new(),
            open_until: None,
            probe_successes: 0,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        while self.failures.front().is_some_and(|at| *at <= cutoff) {
            self.failures.pop_front();
        }
    }
}

/// Circuit breaker guarding one remote dependency.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<BreakerState>>,
    total_calls: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: &str, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            clock,
            state: Arc::new(RwLock::new(BreakerState::closed())),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker name used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the cooldown transition if it is due.
    pub async fn state(&self) -> State {
        let mut state = self.state.write().await;
        self.refresh(&mut state);
        state.state
    }

    /// Failures currently inside the rolling window.
    pub async fn failures_in_window(&self) -> usize {
        let mut state = self.state.write().await;
        state.prune(self.clock.now(), self.config.window);
        state.failures.len()
    }

    /// Call an operation; every error counts as a failure.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the breaker is open, or
    /// `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Call an operation; only errors for which `counts_as_failure` returns
    /// true are recorded in the window.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the breaker is open, or
    /// `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call_with<F, Fut, T, E, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.can_attempt().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if counts_as_failure(&err) {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Whether a call may go through right now.
    pub async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;
        self.refresh(&mut state);
        state.state != State::Open
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if state.state == State::HalfOpen {
            state.probe_successes += 1;
            if state.probe_successes >= self.config.success_threshold {
                tracing::info!(breaker = %self.name, "Circuit breaker transitioning HALF_OPEN -> CLOSED");
                *state = BreakerState::closed();
                self.publish_state(State::Closed);
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut state = self.state.write().await;
        self.refresh(&mut state);

        match state.state {
            State::Closed => {
                state.failures.push_back(now);
                state.prune(now, self.config.window);
                if state.failures.len() >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.failures.len(),
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    self.open(&mut state, now);
                }
            }
            State::HalfOpen => {
                tracing::warn!(
                    breaker = %self.name,
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (probe failed)"
                );
                state.failures.push_back(now);
                self.open(&mut state, now);
            }
            State::Open => {
                state.failures.push_back(now);
                state.prune(now, self.config.window);
            }
        }
    }

    /// Force the breaker closed and forget recorded failures.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        *state = BreakerState::closed();
        self.publish_state(State::Closed);
    }

    /// Call counters since creation.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    fn open(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::from_std(self.config.cooldown).unwrap_or(chrono::Duration::MAX);
        state.state = State::Open;
        state.open_until = Some(now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC));
        state.probe_successes = 0;
        metrics::counter!("raffle_circuit_breaker_open_total", "breaker" => self.name.to_string())
            .increment(1);
        self.publish_state(State::Open);
    }

    fn refresh(&self, state: &mut BreakerState) {
        if state.state != State::Open {
            return;
        }
        let now = self.clock.now();
        if state.open_until.is_some_and(|until| now >= until) {
            tracing::info!(breaker = %self.name, "Circuit breaker transitioning OPEN -> HALF_OPEN");
            state.state = State::HalfOpen;
            state.open_until = None;
            state.probe_successes = 0;
            state.prune(now, self.config.window);
            self.publish_state(State::HalfOpen);
        }
    }

    fn publish_state(&self, state: State) {
        let value = match state {
            State::Closed => 0.0,
            State::HalfOpen => 1.0,
            State::Open => 2.0,
        };
        metrics::gauge!("raffle_circuit_breaker_state", "breaker" => self.name.to_string()).set(value);
    }
}

/// Counters for breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted, including rejected ones
    pub total_calls: u64,
    /// Failures recorded
    pub total_failures: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use raffle_testing::mocks::ManualClock;

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .window(Duration::from_secs(120))
            .cooldown(Duration::from_secs(60))
            .build();
        CircuitBreaker::new("test", config, clock.clone())
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_in_window() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);

        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(breaker.metrics().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);

        fail(&breaker).await;
        fail(&breaker).await;
        clock.advance(Duration::from_secs(121));
        fail(&breaker).await;

        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.failures_in_window().await, 1);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_closes_on_success() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        clock.advance(Duration::from_secs(59));
        assert_eq!(breaker.state().await, State::Open);

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.state().await, State::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, String>(7) }).await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.failures_in_window().await, 0);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(60));

        fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn test_non_counting_errors_are_ignored() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);

        for _ in 0..5 {
            let result = breaker
                .call_with(|| async { Err::<(), _>(400_u16) }, |status| *status >= 500)
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Inner(400))));
        }

        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.failures_in_window().await, 0);
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
        assert!(breaker.call(|| async { Ok::<_, String>(()) }).await.is_ok());
    }
}
