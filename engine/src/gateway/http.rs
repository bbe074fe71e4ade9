//! HTTP transport for the payment provider's button API.
//!
//! Every request carries the bearer token and an `X-Correlation-Id` header.
//! A response is only accepted when its status is 2xx, its content type is
//! JSON and its body parses; anything else is a [`GatewayError`].

use super::{
    ConfirmRequest, ConfirmResponse, GatewayError, PaymentGateway, PrepareRequest, PrepareResponse,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

/// Header carrying the correlation id
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// Longest error body kept in [`GatewayError::Http`]
const MAX_ERROR_BODY: usize = 512;

/// Endpoint settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Provider base URL, without trailing slash
    pub base_url: String,
    /// Bearer token
    pub token: String,
    /// Merchant store id
    pub store_id: String,
    /// Buyer return URL after paying
    pub response_url: String,
    /// Buyer return URL after canceling
    pub cancellation_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePrepareResponse {
    payment_id: Value,
    pay_with_card: Option<String>,
    pay_with_pay_phone: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConfirmResponse {
    status_code: i32,
    authorization_code: Option<String>,
    transaction_status: Option<String>,
    message: Option<String>,
}

/// Payment gateway over HTTPS.
#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    /// Build a client with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Network`] if the TLS backend cannot be initialized.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        correlation_id: &str,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{path}", self.config.base_url);
        tracing::debug!(%url, correlation_id, "Calling payment gateway");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .header(CORRELATION_HEADER, correlation_id)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        decode(response).await
    }
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(MAX_ERROR_BODY)
            .collect();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !content_type.starts_with("application/json") {
        return Err(GatewayError::InvalidResponse(format!(
            "expected application/json, got '{content_type}'"
        )));
    }

    let bytes = response.bytes().await.map_err(classify)?;
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

fn payment_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse, GatewayError> {
        let body = json!({
            "amount": request.amount,
            "amountWithoutTax": request.amount,
            "currency": request.currency,
            "clientTransactionId": request.client_transaction_id,
            "storeId": self.config.store_id,
            "reference": request.reference,
            "responseUrl": self.config.response_url,
            "cancellationUrl": self.config.cancellation_url,
        });
        let wire: WirePrepareResponse = self
            .post("/api/button/Prepare", &body, &request.correlation_id)
            .await?;

        let payment_id = payment_id_text(&wire.payment_id)
            .ok_or_else(|| GatewayError::InvalidResponse("missing paymentId".to_string()))?;
        let redirect_url = wire
            .pay_with_card
            .or(wire.pay_with_pay_phone)
            .ok_or_else(|| GatewayError::InvalidResponse("missing redirect URL".to_string()))?;

        Ok(PrepareResponse {
            payment_id,
            redirect_url,
        })
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmResponse, GatewayError> {
        let id = request
            .payment_id
            .parse::<i64>()
            .map_or_else(|_| json!(request.payment_id), |n| json!(n));
        let body = json!({
            "id": id,
            "clientTxId": request.client_transaction_id,
        });
        let wire: WireConfirmResponse = self
            .post("/api/button/V2/Confirm", &body, &request.correlation_id)
            .await?;

        Ok(ConfirmResponse {
            status_code: wire.status_code,
            authorization_code: wire.authorization_code,
            transaction_status: wire.transaction_status,
            message: wire.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_id_accepts_numbers_and_strings() {
        assert_eq!(payment_id_text(&json!(123_456)), Some("123456".to_string()));
        assert_eq!(payment_id_text(&json!("pay-1")), Some("pay-1".to_string()));
        assert_eq!(payment_id_text(&json!("")), None);
        assert_eq!(payment_id_text(&Value::Null), None);
    }
}
