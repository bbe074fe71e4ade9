//! Error taxonomy for engine operations.
//!
//! Every variant maps to a stable code (see [`EngineError::code`]) that admin
//! tooling can switch on, and to an end-user message that never leaks
//! provider or recovery internals (see [`EngineError::user_message`]).

use crate::types::{SaleId, SaleStatus, TicketNumber};
use thiserror::Error;

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bad input, rejected before any transaction opens
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requested numbers are sold or held by another session
    #[error("Ticket numbers unavailable: {}", join_numbers(.numbers))]
    AvailabilityConflict {
        /// Offending numbers, sorted
        numbers: Vec<TicketNumber>,
    },

    /// Random pick could not find enough AVAILABLE tickets
    #[error("Insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Tickets asked for
        requested: u32,
        /// Tickets found
        available: u32,
    },

    /// Gateway kept failing transiently after all retries
    #[error("Payment gateway unavailable: {0}")]
    GatewayTransient(String),

    /// Gateway calls are short-circuited by the breaker
    #[error("Payment gateway circuit breaker is open")]
    GatewayCircuitOpen,

    /// Gateway refused the request
    #[error("Payment gateway rejected request (status {status}): {message}")]
    GatewayRejected {
        /// HTTP status returned
        status: u16,
        /// Provider message
        message: String,
    },

    /// A sale could not be resolved to any ticket numbers
    #[error(
        "Ghost sale {sale_id}: requested [{}], linked [{}]",
        .requested.join(","),
        .linked.join(",")
    )]
    GhostSale {
        /// Affected sale
        sale_id: SaleId,
        /// Requested-numbers snapshot
        requested: Vec<String>,
        /// Numbers actually linked to the sale
        linked: Vec<String>,
    },

    /// Optimistic or lock collision that survived the bounded retries
    #[error("Concurrency conflict, system busy")]
    ConcurrencyConflict,

    /// Entity lookup failed
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Identifier searched for
        id: String,
    },

    /// Sale state machine refused the transition
    #[error("Sale {sale_id} cannot {action} from {from}")]
    InvalidTransition {
        /// Sale
        sale_id: SaleId,
        /// Current status
        from: SaleStatus,
        /// Attempted action
        action: &'static str,
    },

    /// No raffle is currently ACTIVE
    #[error("No active raffle")]
    NoActiveRaffle,

    /// Unit of work exceeded its time budget
    #[error("Transaction timed out: {0}")]
    Timeout(&'static str),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

fn join_numbers(numbers: &[TicketNumber]) -> String {
    numbers
        .iter()
        .copied()
        .map(TicketNumber::padded)
        .collect::<Vec<_>>()
        .join(",")
}

impl EngineError {
    /// Stable taxonomy code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::AvailabilityConflict { .. } => "AVAILABILITY_CONFLICT",
            Self::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            Self::GatewayTransient(_) => "GATEWAY_TRANSIENT",
            Self::GatewayCircuitOpen => "GATEWAY_CIRCUIT_OPEN",
            Self::GatewayRejected { .. } => "GATEWAY_REJECTED",
            Self::GhostSale { .. } => "GHOST_SALE",
            Self::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NoActiveRaffle => "NO_ACTIVE_RAFFLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) => "STORAGE",
        }
    }

    /// Message safe to show an end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(_)
            | Self::AvailabilityConflict { .. }
            | Self::InsufficientInventory { .. }
            | Self::NotFound { .. }
            | Self::InvalidTransition { .. } => self.to_string(),
            Self::GatewayCircuitOpen => {
                "Payments are temporarily unavailable, please try again shortly".to_string()
            }
            Self::GatewayTransient(_) | Self::GatewayRejected { .. } | Self::GhostSale { .. } => {
                "Payment processing is delayed, we will confirm your tickets shortly".to_string()
            }
            Self::ConcurrencyConflict | Self::Timeout(_) => {
                "The system is busy, please try again".to_string()
            }
            Self::NoActiveRaffle => "Ticket sales are closed".to_string(),
            Self::Storage(_) => "Something went wrong, please try again".to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayTransient(_)
                | Self::GatewayCircuitOpen
                | Self::ConcurrencyConflict
                | Self::Timeout(_)
        )
    }

    /// Shorthand for [`EngineError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
