//! Email collaborator contract.
//!
//! Delivery itself lives outside the engine. The engine only needs to know
//! whether the tickets email went out so it can stamp `last_email_sent_at`
//! or `last_error` on the sale; a failed send never blocks a PAID sale.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Tickets confirmation email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketsEmail {
    /// Recipient address
    pub to: String,
    /// Buyer name for the greeting
    pub customer_name: String,
    /// Short code the buyer can quote to support
    pub sale_code: String,
    /// Padded ticket numbers
    pub tickets: Vec<String>,
    /// Amount paid in minor units
    pub total: i64,
    /// ISO currency code
    pub currency: String,
}

/// Email delivery failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Email delivery failed: {0}")]
pub struct MailError(pub String);

/// Sends buyer-facing emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver the tickets email.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`] if the message was not accepted for delivery.
    async fn send_tickets_email(&self, email: &TicketsEmail) -> Result<(), MailError>;
}

/// Mailer that only writes a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_tickets_email(&self, email: &TicketsEmail) -> Result<(), MailError> {
        tracing::info!(
            to = %email.to,
            sale_code = %email.sale_code,
            tickets = email.tickets.len(),
            total = email.total,
            "Tickets email handed off"
        );
        Ok(())
    }
}

/// Recording mailer for tests.
///
/// Keeps every email it was asked to send and fails while
/// [`MockMailer::fail_with`] is set.
#[derive(Debug, Clone, Default)]
pub struct MockMailer {
    sent: Arc<Mutex<Vec<TicketsEmail>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockMailer {
    /// Create a mailer that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent send with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(message.into());
    }

    /// Accept sends again.
    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Emails accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<TicketsEmail> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_tickets_email(&self, email: &TicketsEmail) -> Result<(), MailError> {
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(MailError(message));
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(email.clone());
        Ok(())
    }
}
