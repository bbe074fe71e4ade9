//! In-memory implementation of the storage contract.
//!
//! [`InMemoryRaffleStore`] serializes every transaction behind one async
//! mutex: `begin` takes the lock and clones the committed state into a working
//! copy, `commit` writes the copy back, and dropping the transaction discards
//! it. That gives the same all-or-nothing visibility the engine relies on from
//! PostgreSQL, with strictly serial execution in place of row locks.
//!
//! Helpers outside the contract let tests inspect state and simulate crashes
//! (rows deleted behind the engine's back, injected commit conflicts).

#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use raffle_core::{
    Customer, CustomerId, EngineError, NewCustomer, Raffle, RaffleId, RaffleStatus, RaffleStore,
    RaffleTx, Result, Sale, SaleId, SaleStatus, Ticket, TicketNumber, TicketStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    raffles: Vec<Raffle>,
    tickets: BTreeMap<(RaffleId, TicketNumber), Ticket>,
    sales: HashMap<SaleId, Sale>,
    customers: HashMap<String, Customer>,
}

/// Serializable in-memory store for tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRaffleStore {
    state: Arc<Mutex<MemoryState>>,
    injected_conflicts: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
}

impl InMemoryRaffleStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with
    /// [`EngineError::ConcurrencyConflict`] (their writes are discarded).
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Delete ticket rows outright, as if the write that created them was lost.
    pub async fn delete_tickets(&self, raffle_id: RaffleId, numbers: &[TicketNumber]) {
        let mut state = self.state.lock().await;
        for number in numbers {
            state.tickets.remove(&(raffle_id, *number));
        }
    }

    /// Write a ticket row directly.
    pub async fn put_ticket(&self, ticket: Ticket) {
        let mut state = self.state.lock().await;
        state.tickets.insert((ticket.raffle_id, ticket.number), ticket);
    }

    /// Write a sale directly, bypassing the immutability of `requested_numbers`.
    pub async fn put_sale(&self, sale: Sale) {
        let mut state = self.state.lock().await;
        state.sales.insert(sale.id, sale);
    }

    /// Committed ticket row.
    pub async fn ticket(&self, raffle_id: RaffleId, number: TicketNumber) -> Option<Ticket> {
        self.state.lock().await.tickets.get(&(raffle_id, number)).cloned()
    }

    /// Every committed ticket row of a raffle, ordered by number.
    pub async fn tickets(&self, raffle_id: RaffleId) -> Vec<Ticket> {
        self.state
            .lock()
            .await
            .tickets
            .range((raffle_id, TicketNumber::MIN)..=(raffle_id, TicketNumber::MAX))
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Committed sale.
    pub async fn sale(&self, sale_id: SaleId) -> Option<Sale> {
        self.state.lock().await.sales.get(&sale_id).cloned()
    }

    /// Every committed raffle, oldest first.
    pub async fn raffles(&self) -> Vec<Raffle> {
        self.state.lock().await.raffles.clone()
    }
}

#[async_trait]
impl RaffleStore for InMemoryRaffleStore {
    async fn begin(&self) -> Result<Box<dyn RaffleTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            injected_conflicts: Arc::clone(&self.injected_conflicts),
            commits: Arc::clone(&self.commits),
        }))
    }
}

/// Transaction over [`InMemoryRaffleStore`].
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    injected_conflicts: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
}

impl MemoryTx {
    fn raffle_tickets(&self, raffle_id: RaffleId) -> impl Iterator<Item = &Ticket> {
        self.working
            .tickets
            .range((raffle_id, TicketNumber::MIN)..=(raffle_id, TicketNumber::MAX))
            .map(|(_, t)| t)
    }
}

#[async_trait]
impl RaffleTx for MemoryTx {
    async fn active_raffle(&mut self) -> Result<Option<Raffle>> {
        Ok(self
            .working
            .raffles
            .iter()
            .rev()
            .find(|r| r.status == RaffleStatus::Active)
            .cloned())
    }

    async fn insert_raffle(&mut self, raffle: &Raffle) -> Result<()> {
        if self.working.raffles.iter().any(|r| r.id == raffle.id) {
            return Err(EngineError::Storage(format!("raffle {} already exists", raffle.id)));
        }
        self.working.raffles.push(raffle.clone());
        Ok(())
    }

    async fn close_raffle(&mut self, raffle_id: RaffleId, at: DateTime<Utc>) -> Result<()> {
        if let Some(raffle) = self.working.raffles.iter_mut().find(|r| r.id == raffle_id) {
            raffle.status = RaffleStatus::Closed;
            raffle.closed_at = Some(at);
        }
        Ok(())
    }

    async fn seed_missing_tickets(&mut self, raffle_id: RaffleId, max_number: u16) -> Result<u64> {
        let mut created = 0;
        for value in 1..=max_number {
            let number = TicketNumber::new(u32::from(value))?;
            self.working
                .tickets
                .entry((raffle_id, number))
                .or_insert_with(|| {
                    created += 1;
                    Ticket::available(raffle_id, number)
                });
        }
        Ok(created)
    }

    async fn find_tickets(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>> {
        let mut found: Vec<Ticket> = numbers
            .iter()
            .filter_map(|n| self.working.tickets.get(&(raffle_id, *n)).cloned())
            .collect();
        found.sort_by_key(|t| t.number);
        found.dedup_by_key(|t| t.number);
        Ok(found)
    }

    async fn lock_numbers(
        &mut self,
        raffle_id: RaffleId,
        numbers: &[TicketNumber],
    ) -> Result<Vec<Ticket>> {
        for number in numbers {
            self.working
                .tickets
                .entry((raffle_id, *number))
                .or_insert_with(|| Ticket::available(raffle_id, *number));
        }
        self.find_tickets(raffle_id, numbers).await
    }

    async fn claim_available(&mut self, raffle_id: RaffleId, count: u32) -> Result<Vec<Ticket>> {
        let mut available: Vec<Ticket> = self
            .raffle_tickets(raffle_id)
            .filter(|t| t.status == TicketStatus::Available)
            .cloned()
            .collect();
        available.shuffle(&mut rand::thread_rng());
        available.truncate(usize::try_from(count).unwrap_or(usize::MAX));
        Ok(available)
    }

    async fn count_by_status(&mut self, raffle_id: RaffleId, status: TicketStatus) -> Result<u64> {
        let count = self.raffle_tickets(raffle_id).filter(|t| t.status == status).count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn tickets_for_sale(
        &mut self,
        sale_id: SaleId,
        statuses: &[TicketStatus],
    ) -> Result<Vec<Ticket>> {
        Ok(self
            .working
            .tickets
            .values()
            .filter(|t| t.sale_id == Some(sale_id) && statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        exclude: &[SaleId],
        limit: u32,
    ) -> Result<Vec<Ticket>> {
        let mut expired: Vec<Ticket> = self
            .working
            .tickets
            .values()
            .filter(|t| t.is_expired_hold(now))
            .filter(|t| t.sale_id.is_none_or(|id| !exclude.contains(&id)))
            .cloned()
            .collect();
        expired.sort_by_key(|t| (t.reserved_until, t.number));
        expired.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(expired)
    }

    async fn save_tickets(&mut self, tickets: &[Ticket]) -> Result<()> {
        for ticket in tickets {
            self.working
                .tickets
                .insert((ticket.raffle_id, ticket.number), ticket.clone());
        }
        Ok(())
    }

    async fn insert_sale(&mut self, sale: &Sale) -> Result<()> {
        if self.working.sales.contains_key(&sale.id) {
            return Err(EngineError::Storage(format!("sale {} already exists", sale.id)));
        }
        self.working.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    async fn get_sale(&mut self, sale_id: SaleId, _lock: bool) -> Result<Option<Sale>> {
        Ok(self.working.sales.get(&sale_id).cloned())
    }

    async fn find_sale_by_client_tx(&mut self, client_transaction_id: &str) -> Result<Option<Sale>> {
        Ok(self
            .working
            .sales
            .values()
            .find(|s| s.client_transaction_id == client_transaction_id)
            .cloned())
    }

    async fn update_sale(&mut self, sale: &Sale) -> Result<()> {
        let stored = self
            .working
            .sales
            .get_mut(&sale.id)
            .ok_or_else(|| EngineError::not_found("sale", sale.id))?;
        let requested = std::mem::take(&mut stored.requested_numbers);
        *stored = sale.clone();
        stored.requested_numbers = requested;
        Ok(())
    }

    async fn stale_pending_sales(
        &mut self,
        created_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Sale>> {
        let mut stale: Vec<Sale> = self
            .working
            .sales
            .values()
            .filter(|s| s.status == SaleStatus::Pending && s.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.created_at);
        stale.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(stale)
    }

    async fn sales_by_status(&mut self, raffle_id: RaffleId, status: SaleStatus) -> Result<Vec<Sale>> {
        let mut sales: Vec<Sale> = self
            .working
            .sales
            .values()
            .filter(|s| s.raffle_id == raffle_id && s.status == status)
            .cloned()
            .collect();
        sales.sort_by_key(|s| s.created_at);
        Ok(sales)
    }

    async fn upsert_customer(&mut self, customer: &NewCustomer, now: DateTime<Utc>) -> Result<Customer> {
        let record = self
            .working
            .customers
            .entry(customer.id_number.clone())
            .and_modify(|c| {
                c.full_name.clone_from(&customer.full_name);
                c.email.clone_from(&customer.email);
                c.phone.clone_from(&customer.phone);
                c.updated_at = now;
            })
            .or_insert_with(|| Customer {
                id: CustomerId::new(),
                id_number: customer.id_number.clone(),
                full_name: customer.full_name.clone(),
                email: customer.email.clone(),
                phone: customer.phone.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn get_customer(&mut self, customer_id: CustomerId) -> Result<Option<Customer>> {
        Ok(self
            .working
            .customers
            .values()
            .find(|c| c.id == customer_id)
            .cloned())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let pending = self.injected_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.injected_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::ConcurrencyConflict);
        }
        let MemoryTx { mut guard, working, commits, .. } = *self;
        *guard = working;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
