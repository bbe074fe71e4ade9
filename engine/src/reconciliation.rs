//! Payment confirmation and reconciliation.
//!
//! The Confirm workflow, entered from a buyer return, a provider webhook,
//! a manual reconcile or the stale-PENDING batch:
//!
//! ```text
//! sale PAID ──────────► replay through the recovery chain, no gateway call
//! sale CANCELED ──────► reported as closed, no gateway call
//! otherwise ──► Confirm
//!                 ├─ approved ─► one transaction: promote every requested
//!                 │              number to SOLD, then flip to PAID
//!                 │              (ghost: roll back, nothing is PAID)
//!                 │              then best-effort tickets email
//!                 ├─ canceled ─► release holds, sale CANCELED
//!                 └─ other ────► raw status returned, nothing written
//! ```
//!
//! An approval for a sale the sweeper already EXPIRED goes through the same
//! promotion, so the buyer keeps their numbers unless someone else bought
//! them in between.

use crate::email::TicketsEmail;
use crate::engine::{RaffleEngine, settle};
use crate::gateway::{ConfirmRequest, ConfirmResponse, PaymentStatus};
use crate::metrics;
use crate::recovery::RecoveryOutcome;
use crate::sale::load_sale_in;
use raffle_core::{EngineError, Result, Sale, SaleId, SaleStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Provider callback identifying one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmCallback {
    /// Provider payment id
    pub payment_id: String,
    /// Our transaction id, used to find the sale
    pub client_transaction_id: String,
}

/// Result of the Confirm workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmOutcome {
    /// Sale is PAID and owns `ticket_numbers`
    Paid {
        /// Sale
        sale_id: SaleId,
        /// Padded, sorted numbers
        ticket_numbers: Vec<String>,
        /// The sale was already PAID before this call
        replayed: bool,
        /// Tickets email accepted by the mailer during this call
        email_sent: bool,
    },
    /// Provider reported the payment canceled, holds released
    Canceled {
        /// Sale
        sale_id: SaleId,
    },
    /// Provider has not settled the payment yet
    Pending {
        /// Sale
        sale_id: SaleId,
        /// Raw provider status
        status_code: i32,
    },
    /// Sale was already closed, nothing changed
    AlreadyClosed {
        /// Sale
        sale_id: SaleId,
        /// Its terminal status
        status: SaleStatus,
    },
}

/// Result of a manual reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// PAID sale run through the recovery chain
    Recovered(RecoveryOutcome),
    /// PENDING sale run through the Confirm workflow
    Confirmed(ConfirmOutcome),
    /// PENDING sale that never reached Prepare
    NotPrepared {
        /// Sale
        sale_id: SaleId,
    },
    /// CANCELED or EXPIRED sale, left as is
    Closed {
        /// Sale
        sale_id: SaleId,
        /// Its status
        status: SaleStatus,
    },
}

/// Summary of a stale-PENDING batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Sales examined
    pub checked: usize,
    /// Sales that ended PAID
    pub paid: usize,
    /// Sales canceled by the provider or found already closed
    pub canceled: usize,
    /// Sales the provider still reports in flight
    pub still_pending: usize,
    /// Sales with no payment to confirm
    pub unprepared: usize,
    /// Sales that failed, with the error
    pub failed: Vec<(SaleId, String)>,
}

/// Result of a tickets email resend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDelivery {
    /// Sale
    pub sale_id: SaleId,
    /// Numbers sent
    pub ticket_numbers: Vec<String>,
    /// Whether the mailer accepted the message
    pub sent: bool,
}

enum Finalized {
    Paid { sale: Sale, replayed: bool },
    Closed(SaleStatus),
}

impl RaffleEngine {
    /// Run the Confirm workflow for a provider callback.
    ///
    /// Safe to replay: a PAID sale answers from its snapshot without calling
    /// the gateway or writing anything.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for a blank callback
    /// - [`EngineError::NotFound`] when no sale carries the transaction id
    /// - [`EngineError::GhostSale`] when approval could not be backed by tickets
    /// - gateway errors, storage errors, timeouts
    #[tracing::instrument(skip(self, callback), fields(payment_id = %callback.payment_id))]
    pub async fn confirm_payment(&self, callback: ConfirmCallback) -> Result<ConfirmOutcome> {
        if callback.payment_id.trim().is_empty() || callback.client_transaction_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "payment id and client transaction id are required".into(),
            ));
        }

        let client_tx = callback.client_transaction_id.as_str();
        let sale = {
            let mut tx = self.store.begin().await?;
            let outcome = timeout(self.settings.tx_timeout, async {
                tx.find_sale_by_client_tx(client_tx)
                    .await?
                    .ok_or_else(|| EngineError::not_found("sale", client_tx))
            })
            .await;
            settle(tx, outcome, "confirm_lookup").await?
        };

        self.confirm_sale(sale, &callback.payment_id).await
    }

    async fn confirm_sale(&self, sale: Sale, payment_id: &str) -> Result<ConfirmOutcome> {
        let sale_id = sale.id;
        match sale.status {
            SaleStatus::Paid => {
                let recovered = self.repair_sale(sale_id).await?;
                tracing::debug!(%sale_id, tier = recovered.tier.label(), "Confirm replayed on a PAID sale");
                return Ok(ConfirmOutcome::Paid {
                    sale_id,
                    ticket_numbers: recovered.ticket_numbers,
                    replayed: true,
                    email_sent: false,
                });
            }
            SaleStatus::Canceled => {
                tracing::info!(%sale_id, "Confirm on a CANCELED sale ignored");
                return Ok(ConfirmOutcome::AlreadyClosed {
                    sale_id,
                    status: SaleStatus::Canceled,
                });
            }
            SaleStatus::Pending | SaleStatus::Expired => {}
        }

        if let Some(recorded) = sale.payment_id.as_deref().filter(|recorded| *recorded != payment_id) {
            tracing::warn!(
                %sale_id,
                recorded_payment_id = recorded,
                callback_payment_id = payment_id,
                "Callback payment id differs from the one recorded at prepare"
            );
        }

        let correlation_id = Uuid::new_v4().to_string();
        let request = ConfirmRequest {
            payment_id: payment_id.to_string(),
            client_transaction_id: sale.client_transaction_id.clone(),
            correlation_id: correlation_id.clone(),
        };
        let response = match self.gateway.confirm(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.record_sale_error(sale_id, format!("confirm failed: {err}")).await;
                return Err(EngineError::from(err));
            }
        };

        match response.status() {
            PaymentStatus::Approved => self.approve(&sale, payment_id, &response, &correlation_id).await,
            PaymentStatus::Canceled => self.cancel_from_gateway(&sale, &response).await,
            PaymentStatus::Pending(status_code) => {
                tracing::info!(
                    %sale_id,
                    %correlation_id,
                    status_code,
                    provider_status = ?response.transaction_status,
                    "Payment not settled yet"
                );
                Ok(ConfirmOutcome::Pending { sale_id, status_code })
            }
        }
    }

    async fn approve(
        &self,
        sale: &Sale,
        payment_id: &str,
        response: &ConfirmResponse,
        correlation_id: &str,
    ) -> Result<ConfirmOutcome> {
        let sale_id = sale.id;
        if sale.status == SaleStatus::Expired {
            tracing::warn!(%sale_id, %correlation_id, "Late approval for an EXPIRED sale, attempting finalization");
        }

        let finalized = self
            .finalize_paid(sale_id, payment_id, response.authorization_code.as_deref(), sale.requested_numbers.len())
            .await;

        match finalized {
            Ok(Finalized::Paid { sale, replayed }) => {
                if !replayed {
                    metrics::record_sale_paid(sale.ticket_numbers.len(), sale.amount);
                    tracing::info!(
                        %sale_id,
                        %correlation_id,
                        numbers = ?sale.ticket_numbers,
                        "Sale PAID"
                    );
                }
                let email_sent = if replayed {
                    false
                } else {
                    self.deliver_tickets_email(&sale).await
                };
                Ok(ConfirmOutcome::Paid {
                    sale_id,
                    ticket_numbers: sale.ticket_numbers,
                    replayed,
                    email_sent,
                })
            }
            Ok(Finalized::Closed(status)) => {
                tracing::error!(
                    %sale_id,
                    %correlation_id,
                    %status,
                    authorization_code = ?response.authorization_code,
                    "Provider approved a closed sale, refund required"
                );
                self.record_sale_error(sale_id, format!("approved by provider while {status}"))
                    .await;
                Ok(ConfirmOutcome::AlreadyClosed { sale_id, status })
            }
            Err(err) => {
                if matches!(err, EngineError::GhostSale { .. }) {
                    self.report_ghost(&err).await;
                }
                Err(err)
            }
        }
    }

    /// Promote every requested number to SOLD and flip the sale to PAID, in
    /// one transaction. Any gap aborts the whole unit of work.
    async fn finalize_paid(
        &self,
        sale_id: SaleId,
        payment_id: &str,
        authorization_code: Option<&str>,
        ticket_count: usize,
    ) -> Result<Finalized> {
        let budget = self.timeout_for(ticket_count);
        self.with_conflict_retry("finalize_paid", move || async move {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let outcome = timeout(budget, async {
                let mut sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                match sale.status {
                    SaleStatus::Paid => {
                        let recovered = self.recover_in(tx.as_mut(), &mut sale, now).await?;
                        if recovered.wrote {
                            sale.updated_at = now;
                            tx.update_sale(&sale).await?;
                        }
                        return Ok(Finalized::Paid { sale, replayed: true });
                    }
                    SaleStatus::Canceled => return Ok(Finalized::Closed(SaleStatus::Canceled)),
                    SaleStatus::Pending | SaleStatus::Expired => {}
                }

                sale.status = SaleStatus::Paid;
                sale.payment_id = Some(payment_id.to_string());
                sale.authorization_code = authorization_code.map(str::to_string);
                sale.confirmed_at = Some(now);
                sale.updated_at = now;
                sale.ticket_numbers.clear();
                self.recover_in(tx.as_mut(), &mut sale, now).await?;
                tx.update_sale(&sale).await?;
                Ok(Finalized::Paid { sale, replayed: false })
            })
            .await;
            settle(tx, outcome, "finalize_paid").await
        })
        .await
    }

    async fn cancel_from_gateway(&self, sale: &Sale, response: &ConfirmResponse) -> Result<ConfirmOutcome> {
        let sale_id = sale.id;
        if sale.status != SaleStatus::Pending {
            return Ok(ConfirmOutcome::AlreadyClosed {
                sale_id,
                status: sale.status,
            });
        }

        let closed = self
            .with_conflict_retry("cancel_from_gateway", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(self.settings.tx_timeout, async {
                    let sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                    if sale.status != SaleStatus::Pending {
                        return Ok(Err(sale.status));
                    }
                    self.close_pending_sale_in(tx.as_mut(), sale, SaleStatus::Canceled, now)
                        .await
                        .map(Ok)
                })
                .await;
                settle(tx, outcome, "cancel_from_gateway").await
            })
            .await?;

        match closed {
            Ok(_) => {
                tracing::info!(%sale_id, provider_message = ?response.message, "Payment canceled at the provider");
                Ok(ConfirmOutcome::Canceled { sale_id })
            }
            Err(status) => Ok(ConfirmOutcome::AlreadyClosed { sale_id, status }),
        }
    }

    /// Reconcile one sale on demand.
    ///
    /// # Errors
    ///
    /// Anything [`RaffleEngine::repair_sale`] or the Confirm workflow returns.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_sale(&self, sale_id: SaleId) -> Result<ReconcileOutcome> {
        let sale = self.get_sale(sale_id).await?;
        match (sale.status, sale.payment_id.clone()) {
            (SaleStatus::Paid, _) => self.repair_sale(sale_id).await.map(ReconcileOutcome::Recovered),
            (SaleStatus::Pending, Some(payment_id)) => self
                .confirm_sale(sale, &payment_id)
                .await
                .map(ReconcileOutcome::Confirmed),
            (SaleStatus::Pending, None) => Ok(ReconcileOutcome::NotPrepared { sale_id }),
            (status, _) => Ok(ReconcileOutcome::Closed { sale_id, status }),
        }
    }

    /// Run Confirm for PENDING sales created more than `older_than` ago.
    ///
    /// At most `reconcile_batch_size` sales per call, oldest first. A failing
    /// sale is recorded in the report and never stops the batch.
    ///
    /// # Errors
    ///
    /// Only when the stale sales cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_stale(&self, older_than: Duration) -> Result<ReconcileReport> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|_| EngineError::Validation("reconcile age is out of range".into()))?;
        let cutoff = self.clock.now() - age;
        let limit = self.settings.reconcile_batch_size;

        let stale = {
            let mut tx = self.store.begin().await?;
            let outcome = timeout(self.settings.tx_timeout, tx.stale_pending_sales(cutoff, limit)).await;
            settle(tx, outcome, "reconcile_stale").await?
        };

        let mut report = ReconcileReport::default();
        for sale in stale {
            report.checked += 1;
            let sale_id = sale.id;
            let Some(payment_id) = sale.payment_id.clone() else {
                report.unprepared += 1;
                continue;
            };
            match self.confirm_sale(sale, &payment_id).await {
                Ok(ConfirmOutcome::Paid { .. }) => report.paid += 1,
                Ok(ConfirmOutcome::Canceled { .. } | ConfirmOutcome::AlreadyClosed { .. }) => {
                    report.canceled += 1;
                }
                Ok(ConfirmOutcome::Pending { .. }) => report.still_pending += 1,
                Err(err) => {
                    tracing::warn!(%sale_id, error = %err, "Reconcile failed for sale");
                    report.failed.push((sale_id, err.to_string()));
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                paid = report.paid,
                canceled = report.canceled,
                still_pending = report.still_pending,
                unprepared = report.unprepared,
                failed = report.failed.len(),
                "Stale PENDING reconcile finished"
            );
        }
        Ok(report)
    }

    /// Re-send the tickets email of a PAID sale, recovering its numbers first.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidTransition`] unless the sale is PAID, plus
    /// anything [`RaffleEngine::repair_sale`] returns. A mailer failure is
    /// reported through [`EmailDelivery::sent`], not as an error.
    #[tracing::instrument(skip(self))]
    pub async fn resend_tickets_email(&self, sale_id: SaleId) -> Result<EmailDelivery> {
        let sale = self.get_sale(sale_id).await?;
        if sale.status != SaleStatus::Paid {
            return Err(EngineError::InvalidTransition {
                sale_id,
                from: sale.status,
                action: "resend tickets",
            });
        }

        let recovered = self.repair_sale(sale_id).await?;
        let sale = self.get_sale(sale_id).await?;
        let sent = self.deliver_tickets_email(&sale).await;
        Ok(EmailDelivery {
            sale_id,
            ticket_numbers: recovered.ticket_numbers,
            sent,
        })
    }

    /// Hand the tickets email to the mailer and stamp the result on the sale.
    async fn deliver_tickets_email(&self, sale: &Sale) -> bool {
        let customer = {
            let lookup = async {
                let mut tx = self.store.begin().await?;
                let outcome = timeout(self.settings.tx_timeout, tx.get_customer(sale.customer_id)).await;
                settle(tx, outcome, "load_customer").await
            };
            match lookup.await {
                Ok(Some(customer)) => customer,
                Ok(None) => {
                    tracing::warn!(sale_id = %sale.id, customer_id = %sale.customer_id, "Sale has no customer record");
                    self.record_sale_error(sale.id, "tickets email not sent: customer missing".into())
                        .await;
                    return false;
                }
                Err(err) => {
                    tracing::warn!(sale_id = %sale.id, error = %err, "Could not load customer for email");
                    return false;
                }
            }
        };

        let email = TicketsEmail {
            to: customer.email,
            customer_name: customer.full_name,
            sale_code: sale_code(sale),
            tickets: sale.ticket_numbers.clone(),
            total: sale.amount,
            currency: sale.currency.clone(),
        };

        match self.mailer.send_tickets_email(&email).await {
            Ok(()) => {
                self.stamp_email_sent(sale.id).await;
                true
            }
            Err(err) => {
                tracing::warn!(sale_id = %sale.id, error = %err, "Tickets email failed");
                self.record_sale_error(sale.id, err.to_string()).await;
                false
            }
        }
    }

    async fn stamp_email_sent(&self, sale_id: SaleId) {
        let result = async {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let outcome = timeout(self.settings.tx_timeout, async {
                let mut sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                sale.last_email_sent_at = Some(now);
                sale.updated_at = now;
                tx.update_sale(&sale).await
            })
            .await;
            settle(tx, outcome, "stamp_email_sent").await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(%sale_id, error = %err, "Could not record email delivery");
        }
    }
}

/// Short code a buyer can quote to support.
fn sale_code(sale: &Sale) -> String {
    sale.client_transaction_id
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase()
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::sale::{CreateSaleRequest, TicketSelection};
    use crate::testkit::{Fixtures, buyer, engine_with, n};
    use raffle_core::{SessionId, TicketStatus};
    use raffle_testing::InMemoryRaffleStore;

    async fn prepared_sale(engine: &RaffleEngine, numbers: &[u32]) -> (Sale, ConfirmCallback) {
        engine.ensure_active_raffle().await.unwrap();
        let sale = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("S1"),
                selection: TicketSelection::Explicit(numbers.iter().map(|v| n(*v)).collect()),
            })
            .await
            .unwrap();
        let prepared = engine.prepare_payment(sale.id).await.unwrap();
        let callback = ConfirmCallback {
            payment_id: prepared.payment_id,
            client_transaction_id: sale.client_transaction_id.clone(),
        };
        (sale, callback)
    }

    fn approve(fx: &Fixtures, callback: &ConfirmCallback) {
        fx.gateway.approve(&callback.payment_id, "AUTH-1");
    }

    #[tokio::test]
    async fn test_approval_sells_tickets_and_sends_email() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[2, 1]).await;
        approve(&fx, &callback);

        let outcome = engine.confirm_payment(callback).await.unwrap();

        assert_eq!(
            outcome,
            ConfirmOutcome::Paid {
                sale_id: sale.id,
                ticket_numbers: vec!["0001".into(), "0002".into()],
                replayed: false,
                email_sent: true,
            }
        );
        let stored = store.sale(sale.id).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Paid);
        assert_eq!(stored.authorization_code.as_deref(), Some("AUTH-1"));
        assert!(stored.confirmed_at.is_some());
        assert!(stored.last_email_sent_at.is_some());
        assert_eq!(fx.mailer.sent()[0].tickets, vec!["0001", "0002"]);
        assert_eq!(fx.mailer.sent()[0].to, buyer().email);
    }

    #[tokio::test]
    async fn test_callback_for_superseded_prepare_confirms_that_payment() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, first) = prepared_sale(&engine, &[7]).await;
        let second = engine.prepare_payment(sale.id).await.unwrap();
        assert_ne!(second.payment_id, first.payment_id);
        assert_eq!(
            store.sale(sale.id).await.unwrap().payment_id.as_deref(),
            Some(second.payment_id.as_str())
        );
        approve(&fx, &first);

        let outcome = engine.confirm_payment(first.clone()).await.unwrap();

        assert!(matches!(outcome, ConfirmOutcome::Paid { replayed: false, .. }));
        assert_eq!(fx.gateway.confirm_requests()[0].payment_id, first.payment_id);
        let stored = store.sale(sale.id).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Paid);
        assert_eq!(stored.payment_id.as_deref(), Some(first.payment_id.as_str()));
    }

    #[tokio::test]
    async fn test_replay_on_paid_sale_skips_gateway_and_writes() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[5]).await;
        approve(&fx, &callback);
        let first = engine.confirm_payment(callback.clone()).await.unwrap();
        let calls = fx.gateway.confirm_calls();
        let snapshot = store.sale(sale.id).await.unwrap();

        let second = engine.confirm_payment(callback).await.unwrap();

        let (
            ConfirmOutcome::Paid { ticket_numbers: first_numbers, .. },
            ConfirmOutcome::Paid { ticket_numbers, replayed, .. },
        ) = (first, second)
        else {
            unreachable!("both confirms end PAID");
        };
        assert!(replayed);
        assert_eq!(ticket_numbers, first_numbers);
        assert_eq!(fx.gateway.confirm_calls(), calls);
        assert_eq!(store.sale(sale.id).await.unwrap(), snapshot);
        assert_eq!(fx.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_cancel_releases_holds() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[3, 4]).await;
        fx.gateway.cancel(&callback.payment_id);

        let outcome = engine.confirm_payment(callback).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::Canceled { sale_id: sale.id });
        assert_eq!(store.sale(sale.id).await.unwrap().status, SaleStatus::Canceled);
        assert_eq!(engine.count_by_status(TicketStatus::Reserved).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pending_status_changes_nothing() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[6]).await;
        let before = store.sale(sale.id).await.unwrap();

        let outcome = engine.confirm_payment(callback).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::Pending { sale_id: sale.id, status_code: 1 });
        assert_eq!(store.sale(sale.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_email_failure_does_not_block_paid() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[7]).await;
        approve(&fx, &callback);
        fx.mailer.fail_with("smtp down");

        let outcome = engine.confirm_payment(callback).await.unwrap();

        assert!(matches!(outcome, ConfirmOutcome::Paid { email_sent: false, .. }));
        let stored = store.sale(sale.id).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Paid);
        assert!(stored.last_email_sent_at.is_none());
        assert!(stored.last_error.unwrap().contains("smtp down"));

        fx.mailer.recover();
        let resent = engine.resend_tickets_email(sale.id).await.unwrap();
        assert!(resent.sent);
        assert_eq!(resent.ticket_numbers, vec!["0007"]);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_recorded_and_sale_stays_pending() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[8]).await;
        fx.gateway.fail_next_confirms(1, GatewayError::Http { status: 404, body: "unknown payment".into() });

        let err = engine.confirm_payment(callback).await.unwrap_err();

        assert_eq!(err.code(), "GATEWAY_REJECTED");
        let stored = store.sale(sale.id).await.unwrap();
        assert_eq!(stored.status, SaleStatus::Pending);
        assert!(stored.last_error.unwrap().contains("unknown payment"));
    }

    #[tokio::test]
    async fn test_approval_of_a_canceled_sale_never_resurrects_it() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        let (sale, callback) = prepared_sale(&engine, &[9]).await;
        engine.cancel_sale(sale.id).await.unwrap();
        approve(&fx, &callback);

        let outcome = engine.confirm_payment(callback).await.unwrap();

        assert_eq!(
            outcome,
            ConfirmOutcome::AlreadyClosed { sale_id: sale.id, status: SaleStatus::Canceled }
        );
        assert_eq!(fx.gateway.confirm_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_transaction_id() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();

        let err = engine
            .confirm_payment(ConfirmCallback {
                payment_id: "pay-1".into(),
                client_transaction_id: "nope".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_reconcile_sale_routes_by_status() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        let unprepared = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("S9"),
                selection: TicketSelection::Explicit(vec![n(20)]),
            })
            .await
            .unwrap();
        assert_eq!(
            engine.reconcile_sale(unprepared.id).await.unwrap(),
            ReconcileOutcome::NotPrepared { sale_id: unprepared.id }
        );

        let (sale, callback) = prepared_sale(&engine, &[11]).await;
        approve(&fx, &callback);
        assert!(matches!(
            engine.reconcile_sale(sale.id).await.unwrap(),
            ReconcileOutcome::Confirmed(ConfirmOutcome::Paid { replayed: false, .. })
        ));
        assert!(matches!(
            engine.reconcile_sale(sale.id).await.unwrap(),
            ReconcileOutcome::Recovered(RecoveryOutcome { tier: crate::RecoveryTier::Snapshot, .. })
        ));

        engine.cancel_sale(unprepared.id).await.unwrap();
        assert_eq!(
            engine.reconcile_sale(unprepared.id).await.unwrap(),
            ReconcileOutcome::Closed { sale_id: unprepared.id, status: SaleStatus::Canceled }
        );
    }

    #[tokio::test]
    async fn test_reconcile_stale_keeps_going_past_failures() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 30);
        let (paid, paid_cb) = prepared_sale(&engine, &[1]).await;
        let (_, broken_cb) = prepared_sale(&engine, &[2]).await;
        let (waiting, _) = prepared_sale(&engine, &[3]).await;
        approve(&fx, &paid_cb);
        fx.gateway.set_response(
            &broken_cb.payment_id,
            ConfirmResponse {
                status_code: 3,
                authorization_code: None,
                transaction_status: None,
                message: None,
            },
        );
        // Sell number 2 elsewhere so the approval cannot be backed by tickets
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let mut stolen = store.ticket(raffle.id, n(2)).await.unwrap();
        stolen.sell(SaleId::new(), chrono::Utc::now());
        store.put_ticket(stolen).await;

        fx.clock.advance(Duration::from_secs(3 * 3600));
        let report = engine.reconcile_stale(Duration::from_secs(2 * 3600)).await.unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.paid, 1);
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("Ghost sale"));
        assert_eq!(store.sale(paid.id).await.unwrap().status, SaleStatus::Paid);
        assert_eq!(store.sale(waiting.id).await.unwrap().status, SaleStatus::Pending);
    }
}
