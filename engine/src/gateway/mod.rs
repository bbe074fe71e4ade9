//! Payment gateway client contract.
//!
//! The provider exposes two calls: Prepare starts a payment and returns the
//! redirect URL for the buyer, Confirm settles (or polls) one payment by its
//! provider id and our client transaction id.
//!
//! - [`http::HttpPaymentGateway`]: the plain transport
//! - [`resilient::ResilientGateway`]: retry + circuit breaker decorator
//! - [`mock::MockPaymentGateway`]: scripted gateway for tests

use async_trait::async_trait;
use raffle_core::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;
pub mod mock;
pub mod resilient;

/// Provider status code for a canceled payment
pub const STATUS_CANCELED: i32 = 2;

/// Provider status code for an approved payment
pub const STATUS_APPROVED: i32 = 3;

/// Prepare input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Amount in minor units
    pub amount: i64,
    /// ISO currency code
    pub currency: String,
    /// Our transaction id, echoed back on Confirm
    pub client_transaction_id: String,
    /// Free-text reference shown to the buyer
    pub reference: String,
    /// Id propagated to the provider for log correlation
    pub correlation_id: String,
}

/// Prepare result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Provider payment id
    pub payment_id: String,
    /// Where to send the buyer
    pub redirect_url: String,
}

/// Confirm input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    /// Provider payment id
    pub payment_id: String,
    /// Our transaction id
    pub client_transaction_id: String,
    /// Id propagated to the provider for log correlation
    pub correlation_id: String,
}

/// Confirm result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    /// Provider status (2 = canceled, 3 = approved, anything else pending)
    pub status_code: i32,
    /// Authorization code on approval
    pub authorization_code: Option<String>,
    /// Provider's textual status
    pub transaction_status: Option<String>,
    /// Provider message
    pub message: Option<String>,
}

/// What a Confirm response means for the sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Payment approved
    Approved,
    /// Payment canceled at the provider
    Canceled,
    /// Still in flight, carries the raw status code
    Pending(i32),
}

impl ConfirmResponse {
    /// Classify the provider status code.
    #[must_use]
    pub const fn status(&self) -> PaymentStatus {
        match self.status_code {
            STATUS_APPROVED => PaymentStatus::Approved,
            STATUS_CANCELED => PaymentStatus::Canceled,
            other => PaymentStatus::Pending(other),
        }
    }
}

/// Gateway failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Connection or transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its timeout
    #[error("Gateway request timed out")]
    Timeout,

    /// Non-success HTTP status
    #[error("Gateway returned HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Non-JSON or unexpected body, even on a 2xx status
    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    /// Short-circuited by the breaker, no request was sent
    #[error("Payment gateway circuit breaker is open")]
    CircuitOpen,
}

impl GatewayError {
    /// Whether the call may succeed if repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::InvalidResponse(_) => true,
            Self::Http { status, .. } => matches!(*status, 502..=504),
            Self::CircuitOpen => false,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn outcome_label(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            err if err.is_transient() => "transient",
            _ => "rejected",
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CircuitOpen => Self::GatewayCircuitOpen,
            GatewayError::Http { status, body } if !matches!(status, 502..=504) => {
                Self::GatewayRejected {
                    status,
                    message: body,
                }
            }
            other => Self::GatewayTransient(other.to_string()),
        }
    }
}

/// Remote payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Start a payment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the provider did not accept the payment.
    async fn prepare(&self, request: &PrepareRequest) -> Result<PrepareResponse, GatewayError>;

    /// Settle or poll a payment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the provider could not be reached or
    /// answered with something other than a status document.
    async fn confirm(&self, request: &ConfirmRequest) -> Result<ConfirmResponse, GatewayError>;
}
