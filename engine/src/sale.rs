//! Sale lifecycle.
//!
//! ```text
//! PENDING ──► PAID       (finalize, see reconciliation)
//!    │
//!    ├──────► CANCELED   (buyer, gateway or admin)
//!    └──────► EXPIRED    (sweeper, or a lapsed hold taken over)
//! ```
//!
//! A sale is created in the same transaction that reserves its tickets, so
//! `requested_numbers` always names exactly the numbers that were held.

use crate::engine::{RaffleEngine, settle};
use crate::inventory::active_raffle_in;
use crate::metrics;
use chrono::{DateTime, Utc};
use raffle_core::{
    EngineError, NewCustomer, RaffleTx, Result, Sale, SaleId, SaleStatus, SessionId, TicketNumber,
    TicketStatus,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// How the buyer chose their numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketSelection {
    /// Let the engine pick `count` random numbers
    Random {
        /// Tickets wanted
        count: u32,
    },
    /// Exactly these numbers
    Explicit(Vec<TicketNumber>),
}

impl TicketSelection {
    fn len(&self) -> usize {
        match self {
            Self::Random { count } => *count as usize,
            Self::Explicit(numbers) => numbers.len(),
        }
    }
}

/// Input for [`RaffleEngine::create_sale`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSaleRequest {
    /// Buyer details, upserted by id number
    pub customer: NewCustomer,
    /// Buyer session the tickets are held for
    pub session_id: SessionId,
    /// Numbers wanted
    pub selection: TicketSelection,
}

/// Load a sale or fail with [`EngineError::NotFound`].
pub(crate) async fn load_sale_in(tx: &mut dyn RaffleTx, sale_id: SaleId, lock: bool) -> Result<Sale> {
    tx.get_sale(sale_id, lock)
        .await?
        .ok_or_else(|| EngineError::not_found("sale", sale_id))
}

impl RaffleEngine {
    /// Reserve tickets and open a PENDING sale for them in one transaction.
    ///
    /// The customer is upserted first. Tickets the session already holds are
    /// linked to the new sale; the amount is `ticket count * unit price`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for bad customer data or selection
    /// - [`EngineError::AvailabilityConflict`] / [`EngineError::InsufficientInventory`]
    /// - [`EngineError::NoActiveRaffle`], storage errors, timeouts
    #[tracing::instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn create_sale(&self, request: CreateSaleRequest) -> Result<Sale> {
        request.customer.validate()?;
        if request.session_id.as_str().trim().is_empty() {
            return Err(EngineError::Validation("session id is required".into()));
        }
        let selection = match request.selection {
            TicketSelection::Random { count } => {
                self.validate_count(count)?;
                TicketSelection::Random { count }
            }
            TicketSelection::Explicit(numbers) => TicketSelection::Explicit(self.validate_numbers(&numbers)?),
        };

        let budget = self.timeout_for(selection.len());
        let (customer, session, selection) = (&request.customer, &request.session_id, &selection);
        let sale = self
            .with_conflict_retry("create_sale", move || async move {
                let mut tx = self.store.begin().await?;
                let outcome = timeout(budget, self.create_sale_in(tx.as_mut(), customer, session, selection)).await;
                settle(tx, outcome, "create_sale").await
            })
            .await?;

        metrics::record_sale("created");
        tracing::info!(
            sale_id = %sale.id,
            numbers = ?sale.requested_numbers,
            amount = sale.amount,
            "Sale created"
        );
        Ok(sale)
    }

    async fn create_sale_in(
        &self,
        tx: &mut dyn RaffleTx,
        customer: &NewCustomer,
        session: &SessionId,
        selection: &TicketSelection,
    ) -> Result<Sale> {
        let now = self.clock.now();
        let raffle = active_raffle_in(tx).await?;
        let buyer = tx.upsert_customer(customer, now).await?;

        let sale_id = SaleId::new();
        let numbers = match selection {
            TicketSelection::Random { count } => {
                self.reserve_random_in(tx, &raffle, *count, Some(session), Some(sale_id), now)
                    .await?
            }
            TicketSelection::Explicit(numbers) => {
                self.reserve_numbers_in(tx, &raffle, numbers, Some(session), Some(sale_id), now)
                    .await?
            }
        };

        let sale = Sale::pending(sale_id, &raffle, buyer.id, &numbers, now);
        tx.insert_sale(&sale).await?;
        Ok(sale)
    }

    /// Load a sale.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or a storage error.
    pub async fn get_sale(&self, sale_id: SaleId) -> Result<Sale> {
        let mut tx = self.store.begin().await?;
        let outcome = timeout(self.settings.tx_timeout, load_sale_in(tx.as_mut(), sale_id, false)).await;
        settle(tx, outcome, "get_sale").await
    }

    /// Cancel a PENDING sale and release its held tickets.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] unless the sale is PENDING,
    /// [`EngineError::NotFound`], storage errors, timeouts.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_sale(&self, sale_id: SaleId) -> Result<Sale> {
        let sale = self
            .with_conflict_retry("cancel_sale", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(self.settings.tx_timeout, async {
                    let sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                    if sale.status != SaleStatus::Pending {
                        return Err(EngineError::InvalidTransition {
                            sale_id,
                            from: sale.status,
                            action: "cancel",
                        });
                    }
                    self.close_pending_sale_in(tx.as_mut(), sale, SaleStatus::Canceled, now)
                        .await
                })
                .await;
                settle(tx, outcome, "cancel_sale").await
            })
            .await?;

        tracing::info!(sale_id = %sale.id, "Sale canceled");
        Ok(sale)
    }

    /// Move a PENDING sale to CANCELED or EXPIRED, releasing every ticket
    /// still RESERVED for it. Returns the updated sale.
    pub(crate) async fn close_pending_sale_in(
        &self,
        tx: &mut dyn RaffleTx,
        mut sale: Sale,
        status: SaleStatus,
        now: DateTime<Utc>,
    ) -> Result<Sale> {
        debug_assert!(matches!(status, SaleStatus::Canceled | SaleStatus::Expired));

        let mut held = tx.tickets_for_sale(sale.id, &[TicketStatus::Reserved]).await?;
        for ticket in &mut held {
            ticket.release();
        }
        tx.save_tickets(&held).await?;

        sale.status = status;
        sale.updated_at = now;
        tx.update_sale(&sale).await?;

        metrics::record_sale(match status {
            SaleStatus::Expired => "expired",
            _ => "canceled",
        });
        tracing::debug!(sale_id = %sale.id, %status, released = held.len(), "Pending sale closed");
        Ok(sale)
    }
}
