//! Retry + circuit breaker decorator for any [`PaymentGateway`].
//!
//! Each attempt goes through the breaker; only transient failures count
//! against its window and only transient failures are retried. Once the
//! breaker is open, calls fail fast with [`GatewayError::CircuitOpen`] and
//! are not retried.

use super::{
    ConfirmRequest, ConfirmResponse, GatewayError, PaymentGateway, PrepareRequest, PrepareResponse,
};
use crate::metrics;
use async_trait::async_trait;
use raffle_runtime::{CircuitBreaker, CircuitBreakerError, RetryPolicy, retry_with_predicate};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Gateway wrapper applying one shared retry policy and breaker.
#[derive(Clone)]
pub struct ResilientGateway {
    inner: Arc<dyn PaymentGateway>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for ResilientGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientGateway")
            .field("policy", &self.policy)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl ResilientGateway {
    /// Wrap `inner`. Prepare and Confirm share `breaker`.
    #[must_use]
    pub fn new(inner: Arc<dyn PaymentGateway>, policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            policy,
            breaker,
        }
    }

    /// The breaker guarding the provider
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, F, Fut>(&self, op: &'static str, correlation_id: &str, call: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let started = Instant::now();
        let call = &call;

        let result = retry_with_predicate(
            &self.policy,
            move || async move {
                self.breaker
                    .call_with(call, GatewayError::is_transient)
                    .await
                    .map_err(|err| match err {
                        CircuitBreakerError::Open => GatewayError::CircuitOpen,
                        CircuitBreakerError::Inner(inner) => inner,
                    })
            },
            GatewayError::is_transient,
        )
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics::record_gateway_call(op, "ok", elapsed),
            Err(err) => {
                metrics::record_gateway_call(op, err.outcome_label(), elapsed);
                tracing::warn!(op, correlation_id, error = %err, "Payment gateway call failed");
            }
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for ResilientGateway {
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        self.guarded("prepare", &request.correlation_id, || self.inner.prepare(request))
            .await
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmResponse, GatewayError> {
        self.guarded("confirm", &request.correlation_id, || self.inner.confirm(request))
            .await
    }
}
