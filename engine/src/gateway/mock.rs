//! Scripted payment gateway for tests and local runs.

use super::{
    ConfirmRequest, ConfirmResponse, GatewayError, PaymentGateway, PrepareRequest, PrepareResponse,
    STATUS_APPROVED, STATUS_CANCELED,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Provider status reported for payments with no scripted outcome
pub const STATUS_PENDING: i32 = 1;

#[derive(Debug, Default)]
struct MockState {
    confirm_script: HashMap<String, ConfirmResponse>,
    confirm_failures: VecDeque<GatewayError>,
    prepare_failures: VecDeque<GatewayError>,
    prepared: Vec<PrepareRequest>,
    confirmed: Vec<ConfirmRequest>,
    next_payment: u64,
}

/// In-memory gateway.
///
/// Prepare hands out `pay-1`, `pay-2`, ... Confirm answers from a per-payment
/// script and reports pending for anything unscripted. Queued failures are
/// returned before any scripted answer.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockPaymentGateway {
    /// Create a gateway with no scripted outcomes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script Confirm for `payment_id` to report an approval.
    pub fn approve(&self, payment_id: &str, authorization_code: &str) {
        self.set_response(
            payment_id,
            ConfirmResponse {
                status_code: STATUS_APPROVED,
                authorization_code: Some(authorization_code.to_string()),
                transaction_status: Some("Approved".to_string()),
                message: None,
            },
        );
    }

    /// Script Confirm for `payment_id` to report a cancellation.
    pub fn cancel(&self, payment_id: &str) {
        self.set_response(
            payment_id,
            ConfirmResponse {
                status_code: STATUS_CANCELED,
                authorization_code: None,
                transaction_status: Some("Canceled".to_string()),
                message: Some("Canceled by user".to_string()),
            },
        );
    }

    /// Script an arbitrary Confirm response for `payment_id`.
    pub fn set_response(&self, payment_id: &str, response: ConfirmResponse) {
        self.lock()
            .confirm_script
            .insert(payment_id.to_string(), response);
    }

    /// Fail the next `count` Confirm calls with `error`.
    pub fn fail_next_confirms(&self, count: usize, error: GatewayError) {
        let mut state = self.lock();
        state
            .confirm_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fail the next `count` Prepare calls with `error`.
    pub fn fail_next_prepares(&self, count: usize, error: GatewayError) {
        let mut state = self.lock();
        state
            .prepare_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Drop every queued failure.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.confirm_failures.clear();
        state.prepare_failures.clear();
    }

    /// Prepare calls that reached the gateway
    #[must_use]
    pub fn prepare_calls(&self) -> usize {
        self.lock().prepared.len()
    }

    /// Confirm calls that reached the gateway
    #[must_use]
    pub fn confirm_calls(&self) -> usize {
        self.lock().confirmed.len()
    }

    /// Every Prepare request received, in order
    #[must_use]
    pub fn prepare_requests(&self) -> Vec<PrepareRequest> {
        self.lock().prepared.clone()
    }

    /// Every Confirm request received, in order
    #[must_use]
    pub fn confirm_requests(&self) -> Vec<ConfirmRequest> {
        self.lock().confirmed.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        let mut state = self.lock();
        state.prepared.push(request.clone());
        if let Some(error) = state.prepare_failures.pop_front() {
            return Err(error);
        }

        state.next_payment += 1;
        let payment_id = format!("pay-{}", state.next_payment);
        tracing::debug!(%payment_id, client_tx = %request.client_transaction_id, "Mock payment prepared");
        Ok(PrepareResponse {
            redirect_url: format!("https://gateway.test/checkout/{payment_id}"),
            payment_id,
        })
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmResponse, GatewayError> {
        let mut state = self.lock();
        state.confirmed.push(request.clone());
        if let Some(error) = state.confirm_failures.pop_front() {
            return Err(error);
        }

        Ok(state
            .confirm_script
            .get(&request.payment_id)
            .cloned()
            .unwrap_or(ConfirmResponse {
                status_code: STATUS_PENDING,
                authorization_code: None,
                transaction_status: Some("Pending".to_string()),
                message: None,
            }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_confirm_reports_pending() {
        let gateway = MockPaymentGateway::new();
        let response = gateway
            .confirm(&ConfirmRequest {
                payment_id: "pay-9".into(),
                client_transaction_id: "tx".into(),
                correlation_id: "c".into(),
            })
            .await
            .unwrap();
        assert_eq!(response.status_code, STATUS_PENDING);
        assert_eq!(gateway.confirm_calls(), 1);
    }

    #[tokio::test]
    async fn test_prepare_hands_out_sequential_ids() {
        let gateway = MockPaymentGateway::new();
        let request = PrepareRequest {
            amount: 100,
            currency: "USD".into(),
            client_transaction_id: "tx".into(),
            reference: "Sale".into(),
            correlation_id: "c".into(),
        };
        assert_eq!(gateway.prepare(&request).await.unwrap().payment_id, "pay-1");
        assert_eq!(gateway.prepare(&request).await.unwrap().payment_id, "pay-2");
    }
}
