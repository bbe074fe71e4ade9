//! Admin operations: manual release, raffle reset and the paid-sale audit.

use crate::engine::{RaffleEngine, settle};
use crate::inventory::active_raffle_in;
use crate::metrics;
use chrono::{DateTime, Utc};
use raffle_core::{
    EngineError, Raffle, RaffleTx, Result, SaleId, SaleStatus, Ticket, TicketNumber, TicketStatus,
    snapshot_of,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// Result of [`RaffleEngine::manual_release_ticket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRelease {
    /// Ticket the admin asked for
    pub number: TicketNumber,
    /// Its status before the call
    pub previous_status: TicketStatus,
    /// Every ticket returned to AVAILABLE, sorted
    pub released: Vec<TicketNumber>,
    /// Sale canceled as a side effect
    pub canceled_sale: Option<SaleId>,
}

/// What is wrong with a PAID sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditProblem {
    /// `ticket_numbers` is empty
    EmptySnapshot,
    /// `ticket_numbers` differs from the SOLD tickets linked to the sale
    SnapshotMismatch,
}

/// One PAID sale that breaks the no-ghost invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    /// Sale
    pub sale_id: SaleId,
    /// Problem found
    pub problem: AuditProblem,
    /// Stored snapshot
    pub ticket_numbers: Vec<String>,
    /// SOLD tickets actually linked
    pub sold_numbers: Vec<String>,
}

impl RaffleEngine {
    /// Release one ticket of the active raffle by hand.
    ///
    /// - AVAILABLE: nothing to do.
    /// - RESERVED: released; a PENDING sale holding it is canceled, which
    ///   releases the rest of its holds too.
    /// - SOLD: refused unless `force` is set. With `force` the owning sale is
    ///   canceled and all of its tickets are released.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for a SOLD ticket without `force`,
    /// [`EngineError::NoActiveRaffle`], storage errors, timeouts.
    #[tracing::instrument(skip(self), fields(number = %number))]
    pub async fn manual_release_ticket(&self, number: TicketNumber, force: bool) -> Result<ManualRelease> {
        let released = self
            .with_conflict_retry("manual_release_ticket", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(
                    self.settings.tx_timeout,
                    self.manual_release_in(tx.as_mut(), number, force, now),
                )
                .await;
                settle(tx, outcome, "manual_release_ticket").await
            })
            .await?;

        tracing::warn!(
            previous = %released.previous_status,
            released = ?released.released,
            canceled_sale = ?released.canceled_sale,
            force,
            "Ticket released by admin"
        );
        Ok(released)
    }

    async fn manual_release_in(
        &self,
        tx: &mut dyn RaffleTx,
        number: TicketNumber,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<ManualRelease> {
        let raffle = active_raffle_in(tx).await?;
        raffle.check_range(&[number])?;
        let mut ticket = tx
            .lock_numbers(raffle.id, &[number])
            .await?
            .pop()
            .ok_or_else(|| EngineError::not_found("ticket", number))?;

        let mut result = ManualRelease {
            number,
            previous_status: ticket.status,
            released: Vec::new(),
            canceled_sale: None,
        };

        match ticket.status {
            TicketStatus::Available => return Ok(result),
            TicketStatus::Sold if !force => {
                return Err(EngineError::Validation(format!(
                    "ticket {number} is SOLD, releasing it requires force and cancels its sale"
                )));
            }
            TicketStatus::Reserved | TicketStatus::Sold => {}
        }

        let owner = match ticket.sale_id {
            Some(sale_id) => tx.get_sale(sale_id, true).await?,
            None => None,
        };
        let Some(mut sale) = owner.filter(|s| matches!(s.status, SaleStatus::Pending | SaleStatus::Paid)) else {
            ticket.release();
            tx.save_tickets(std::slice::from_ref(&ticket)).await?;
            result.released.push(number);
            return Ok(result);
        };

        let mut linked = tx
            .tickets_for_sale(sale.id, &[TicketStatus::Reserved, TicketStatus::Sold])
            .await?;
        if !linked.iter().any(|t| t.number == number && t.raffle_id == raffle.id) {
            linked.push(ticket);
        }
        for ticket in &mut linked {
            ticket.release();
        }
        tx.save_tickets(&linked).await?;

        if sale.status == SaleStatus::Paid {
            tracing::warn!(sale_id = %sale.id, numbers = ?sale.ticket_numbers, "Canceling PAID sale on admin override");
        }
        sale.status = SaleStatus::Canceled;
        sale.record_error(format!("canceled by admin release of ticket {number}"), now);
        tx.update_sale(&sale).await?;
        metrics::record_sale("canceled");

        result.released = sorted_numbers(&linked);
        result.canceled_sale = Some(sale.id);
        Ok(result)
    }

    /// Close the active raffle and start a fresh one with a new id, seeded
    /// `1..=max_number`, in one bulk transaction.
    ///
    /// Sales of the old raffle keep their records; their tickets stay scoped
    /// to the old raffle id.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for a blank name, storage errors, timeouts.
    #[tracing::instrument(skip(self))]
    pub async fn reset_raffle(&self, name: &str) -> Result<Raffle> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("raffle name is required".into()));
        }

        let raffle = self
            .with_conflict_retry("reset_raffle", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(self.settings.bulk_tx_timeout, async {
                    if let Some(old) = tx.active_raffle().await? {
                        let pending = tx.sales_by_status(old.id, SaleStatus::Pending).await?;
                        if !pending.is_empty() {
                            tracing::warn!(raffle_id = %old.id, pending = pending.len(), "Closing raffle with PENDING sales");
                        }
                        tx.close_raffle(old.id, now).await?;
                    }

                    let settings = &self.settings;
                    let raffle = Raffle::new(
                        name,
                        settings.max_number,
                        settings.unit_price,
                        settings.currency.clone(),
                        now,
                    );
                    tx.insert_raffle(&raffle).await?;
                    tx.seed_missing_tickets(raffle.id, raffle.max_number).await?;
                    Ok(raffle)
                })
                .await;
                settle(tx, outcome, "reset_raffle").await
            })
            .await?;

        metrics::update_tickets_available(u64::from(raffle.max_number));
        tracing::info!(raffle_id = %raffle.id, max_number = raffle.max_number, "Raffle reset");
        Ok(raffle)
    }

    /// List PAID sales of the active raffle whose snapshot is empty or does
    /// not match their SOLD tickets. Writes nothing.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoActiveRaffle`], storage errors, timeouts.
    #[tracing::instrument(skip(self))]
    pub async fn audit_paid_sales(&self) -> Result<Vec<AuditFinding>> {
        let mut tx = self.store.begin().await?;
        let outcome = timeout(self.settings.bulk_tx_timeout, async {
            let raffle = active_raffle_in(tx.as_mut()).await?;
            let mut findings = Vec::new();
            for sale in tx.sales_by_status(raffle.id, SaleStatus::Paid).await? {
                let sold = sorted_numbers(&tx.tickets_for_sale(sale.id, &[TicketStatus::Sold]).await?);
                let sold_numbers = snapshot_of(&sold);
                let problem = if sale.ticket_numbers.is_empty() {
                    AuditProblem::EmptySnapshot
                } else if sale.ticket_numbers != sold_numbers {
                    AuditProblem::SnapshotMismatch
                } else {
                    continue;
                };
                tracing::warn!(sale_id = %sale.id, ?problem, snapshot = ?sale.ticket_numbers, sold = ?sold_numbers, "PAID sale failed audit");
                findings.push(AuditFinding {
                    sale_id: sale.id,
                    problem,
                    ticket_numbers: sale.ticket_numbers,
                    sold_numbers,
                });
            }
            Ok(findings)
        })
        .await;
        settle(tx, outcome, "audit_paid_sales").await
    }
}

fn sorted_numbers(tickets: &[Ticket]) -> Vec<TicketNumber> {
    let mut numbers: Vec<_> = tickets.iter().map(|t| t.number).collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}
