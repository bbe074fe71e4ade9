//! Ticket inventory: raffle bootstrap, seeding and read-side queries.

use crate::engine::{RaffleEngine, settle};
use crate::metrics;
use raffle_core::{
    EngineError, Raffle, RaffleId, RaffleTx, Result, Ticket, TicketNumber, TicketStatus,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

/// Ticket counts for the active raffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Raffle the counts belong to
    pub raffle_id: RaffleId,
    /// AVAILABLE tickets
    pub available: u64,
    /// RESERVED tickets, live or lapsed
    pub reserved: u64,
    /// SOLD tickets
    pub sold: u64,
    /// Highest ticket number of the raffle
    pub total: u64,
}

/// The ACTIVE raffle or [`EngineError::NoActiveRaffle`].
pub(crate) async fn active_raffle_in(tx: &mut dyn RaffleTx) -> Result<Raffle> {
    tx.active_raffle().await?.ok_or(EngineError::NoActiveRaffle)
}

impl RaffleEngine {
    /// Return the ACTIVE raffle, creating and seeding one if none exists.
    ///
    /// When a raffle already exists this runs the seeding repair pass so any
    /// lost ticket row is backfilled as AVAILABLE.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Timeout`].
    #[tracing::instrument(skip(self))]
    pub async fn ensure_active_raffle(&self) -> Result<Raffle> {
        self.with_conflict_retry("ensure_active_raffle", move || async move {
            let mut tx = self.store.begin().await?;
            let outcome = timeout(self.settings.bulk_tx_timeout, self.ensure_active_in(tx.as_mut())).await;
            settle(tx, outcome, "ensure_active_raffle").await
        })
        .await
    }

    async fn ensure_active_in(&self, tx: &mut dyn RaffleTx) -> Result<Raffle> {
        if let Some(raffle) = tx.active_raffle().await? {
            let repaired = tx.seed_missing_tickets(raffle.id, raffle.max_number).await?;
            if repaired > 0 {
                tracing::warn!(raffle_id = %raffle.id, repaired, "Backfilled missing ticket rows");
            }
            return Ok(raffle);
        }

        let settings = &self.settings;
        let raffle = Raffle::new(
            settings.raffle_name.clone(),
            settings.max_number,
            settings.unit_price,
            settings.currency.clone(),
            self.clock.now(),
        );
        tx.insert_raffle(&raffle).await?;
        let seeded = tx.seed_missing_tickets(raffle.id, raffle.max_number).await?;
        tracing::info!(raffle_id = %raffle.id, seeded, "Created active raffle");
        Ok(raffle)
    }

    /// Backfill every missing number in `1..=max_number` as AVAILABLE.
    ///
    /// Idempotent. Returns how many rows were created.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] or [`EngineError::Timeout`].
    #[tracing::instrument(skip(self))]
    pub async fn ensure_seeded(&self, raffle_id: RaffleId, max_number: u16) -> Result<u64> {
        self.with_conflict_retry("ensure_seeded", move || async move {
            let mut tx = self.store.begin().await?;
            let outcome = timeout(
                self.settings.bulk_tx_timeout,
                tx.seed_missing_tickets(raffle_id, max_number),
            )
            .await;
            settle(tx, outcome, "ensure_seeded").await
        })
        .await
    }

    /// Tickets of the active raffle with the given numbers.
    ///
    /// Numbers with no row yet are absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveRaffle`] or a storage error.
    pub async fn find_by_numbers(&self, numbers: &[TicketNumber]) -> Result<Vec<Ticket>> {
        let mut tx = self.store.begin().await?;
        let outcome = timeout(self.settings.tx_timeout, async {
            let raffle = active_raffle_in(tx.as_mut()).await?;
            tx.find_tickets(raffle.id, numbers).await
        })
        .await;
        settle(tx, outcome, "find_by_numbers").await
    }

    /// Count tickets of the active raffle in one status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveRaffle`] or a storage error.
    pub async fn count_by_status(&self, status: TicketStatus) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let outcome = timeout(self.settings.tx_timeout, async {
            let raffle = active_raffle_in(tx.as_mut()).await?;
            tx.count_by_status(raffle.id, status).await
        })
        .await;
        settle(tx, outcome, "count_by_status").await
    }

    /// Per-status counts for the active raffle.
    ///
    /// If the counts do not add up to the raffle size, missing rows are
    /// backfilled first so the totals are exact. Also refreshes the
    /// `raffle_tickets_available` gauge.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveRaffle`] or a storage error.
    pub async fn availability(&self) -> Result<Availability> {
        let summary = self
            .with_conflict_retry("availability", move || async move {
                let mut tx = self.store.begin().await?;
                let outcome = timeout(self.settings.bulk_tx_timeout, availability_in(tx.as_mut())).await;
                settle(tx, outcome, "availability").await
            })
            .await?;
        metrics::update_tickets_available(summary.available);
        Ok(summary)
    }
}

async fn availability_in(tx: &mut dyn RaffleTx) -> Result<Availability> {
    let raffle = active_raffle_in(tx).await?;
    let total = u64::from(raffle.max_number);

    let mut counts = counts_in(tx, raffle.id).await?;
    if counts.0 + counts.1 + counts.2 < total {
        let repaired = tx.seed_missing_tickets(raffle.id, raffle.max_number).await?;
        tracing::warn!(raffle_id = %raffle.id, repaired, "Inventory count short, backfilled rows");
        counts = counts_in(tx, raffle.id).await?;
    }

    let (available, reserved, sold) = counts;
    Ok(Availability {
        raffle_id: raffle.id,
        available,
        reserved,
        sold,
        total,
    })
}

async fn counts_in(tx: &mut dyn RaffleTx, raffle_id: RaffleId) -> Result<(u64, u64, u64)> {
    Ok((
        tx.count_by_status(raffle_id, TicketStatus::Available).await?,
        tx.count_by_status(raffle_id, TicketStatus::Reserved).await?,
        tx.count_by_status(raffle_id, TicketStatus::Sold).await?,
    ))
}
