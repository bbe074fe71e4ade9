//! Storage contract for the engine.
//!
//! The ticket and sale tables are the only shared mutable resource, so every
//! multi-step mutation runs inside one [`RaffleTx`]. Implementations must make
//! the whole unit of work atomic: either everything written through the
//! transaction becomes visible on [`RaffleTx::commit`], or nothing does.
//! Dropping a transaction without committing rolls it back.
//!
//! Row-locking semantics the engine relies on:
//!
//! - [`RaffleTx::lock_numbers`] locks every requested number (creating missing
//!   rows as AVAILABLE first) so check-then-write cannot race.
//! - [`RaffleTx::claim_available`] selects in random order and skips rows
//!   already locked by another transaction, so concurrent pickers never select
//!   the same row and never block each other.

use crate::error::Result;
use crate::types::{
    Customer, CustomerId, NewCustomer, Raffle, RaffleId, Sale, SaleId, SaleStatus, Ticket, TicketNumber,
    TicketStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Opens units of work against the backing store.
#[async_trait]
pub trait RaffleStore: Send + Sync {
    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if no connection is available.
    async fn begin(&self) -> Result<Box<dyn RaffleTx>>;
}

/// One atomic unit of work.
#[async_trait]
pub trait RaffleTx: Send {
    // ------------------------------------------------------------------
    // Raffles
    // ------------------------------------------------------------------

    /// The ACTIVE raffle, if any.
    async fn active_raffle(&mut self) -> Result<Option<Raffle>>;

    /// Insert a raffle record.
    async fn insert_raffle(&mut self, raffle: &Raffle) -> Result<()>;

    /// Mark a raffle CLOSED.
    async fn close_raffle(&mut self, raffle_id: RaffleId, at: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    /// Insert an AVAILABLE row for every number in `1..=max_number` that has
    /// none yet. Returns how many rows were created.
    async fn seed_missing_tickets(&mut self, raffle_id: RaffleId, max_number: u16) -> Result<u64>;

    /// Read tickets by number without locking. Missing numbers are absent.
    async fn find_tickets(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>>;

    /// Create missing rows as AVAILABLE, then lock and return every requested
    /// ticket, ordered by number.
    async fn lock_numbers(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>>;

    /// Lock up to `count` AVAILABLE tickets in random order, skipping rows
    /// locked by concurrent transactions.
    async fn claim_available(&mut self, raffle_id: RaffleId, count: u32) -> Result<Vec<Ticket>>;

    /// Count tickets in a status.
    async fn count_by_status(&mut self, raffle_id: RaffleId, status: TicketStatus) -> Result<u64>;

    /// Lock and return tickets linked to a sale whose status is in `statuses`.
    async fn tickets_for_sale(
        &mut self,
        sale_id: SaleId,
        statuses: &[TicketStatus],
    ) -> Result<Vec<Ticket>>;

    /// Lock up to `limit` RESERVED tickets whose hold lapsed before `now`,
    /// skipping rows locked elsewhere and rows linked to a sale in `exclude`.
    async fn expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        exclude: &[SaleId],
        limit: u32,
    ) -> Result<Vec<Ticket>>;

    /// Upsert full ticket rows keyed by `(raffle_id, number)`.
    async fn save_tickets(&mut self, tickets: &[Ticket]) -> Result<()>;

    // ------------------------------------------------------------------
    // Sales
    // ------------------------------------------------------------------

    /// Insert a new sale.
    async fn insert_sale(&mut self, sale: &Sale) -> Result<()>;

    /// Load a sale, optionally taking a row lock on it.
    async fn get_sale(&mut self, sale_id: SaleId, lock: bool) -> Result<Option<Sale>>;

    /// Look up a sale by the transaction id we sent to the gateway.
    async fn find_sale_by_client_tx(&mut self, client_transaction_id: &str) -> Result<Option<Sale>>;

    /// Overwrite a sale's mutable fields. `requested_numbers` is never
    /// rewritten by implementations.
    async fn update_sale(&mut self, sale: &Sale) -> Result<()>;

    /// PENDING sales created before `created_before`, oldest first.
    async fn stale_pending_sales(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Sale>>;

    /// All sales of a raffle in a status.
    async fn sales_by_status(&mut self, raffle_id: RaffleId, status: SaleStatus) -> Result<Vec<Sale>>;

    // ------------------------------------------------------------------
    // Customers
    // ------------------------------------------------------------------

    /// Insert or refresh a customer keyed by `id_number`.
    async fn upsert_customer(&mut self, customer: &NewCustomer, now: DateTime<Utc>) -> Result<Customer>;

    /// Load a customer by internal id.
    async fn get_customer(&mut self, customer_id: CustomerId) -> Result<Option<Customer>>;

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Make every write visible atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
