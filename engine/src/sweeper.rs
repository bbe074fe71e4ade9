//! Expiry sweeper: reclaims lapsed holds.
//!
//! Holds are grouped by owning sale before anything is written:
//!
//! | Owner                         | Action                               |
//! |-------------------------------|--------------------------------------|
//! | none, CANCELED or EXPIRED     | release the tickets                  |
//! | PENDING, every hold lapsed    | release all its holds, sale EXPIRED  |
//! | PENDING, some hold still live | leave alone until the next pass      |
//! | PAID                          | never touched, logged for repair     |

use crate::engine::{RaffleEngine, settle};
use crate::metrics;
use chrono::{DateTime, Utc};
use raffle_core::{RaffleTx, Result, SaleId, SaleStatus, Ticket, TicketStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::timeout;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Lapsed holds looked at
    pub examined: u64,
    /// Tickets returned to AVAILABLE
    pub released_tickets: u64,
    /// PENDING sales moved to EXPIRED
    pub expired_sales: u64,
    /// Lapsed holds left alone because their sale is PAID
    pub skipped_paid: u64,
}

impl SweepReport {
    fn absorb(&mut self, other: Self) {
        self.examined += other.examined;
        self.released_tickets += other.released_tickets;
        self.expired_sales += other.expired_sales;
        self.skipped_paid += other.skipped_paid;
    }
}

impl RaffleEngine {
    /// Release every lapsed hold and expire the PENDING sales that owned them.
    ///
    /// Works in batches of `sweep_batch_size`, one transaction each, until a
    /// batch comes back short. Sales left alone in one batch are excluded
    /// from the next, so holds behind them are still reached.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`raffle_core::EngineError::Timeout`]. Batches
    /// committed before the failure stay committed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let batch_size = self.settings.sweep_batch_size;
        let mut total = SweepReport::default();
        let mut skipped: BTreeSet<SaleId> = BTreeSet::new();

        loop {
            let excluded: Vec<SaleId> = skipped.iter().copied().collect();
            let exclude = excluded.as_slice();
            let (batch, left_alone) = self
                .with_conflict_retry("sweep_expired", move || async move {
                    let mut tx = self.store.begin().await?;
                    let now = self.clock.now();
                    let outcome = timeout(
                        self.settings.bulk_tx_timeout,
                        self.reclaim_batch_in(tx.as_mut(), now, exclude, batch_size),
                    )
                    .await;
                    settle(tx, outcome, "sweep_expired").await
                })
                .await?;
            total.absorb(batch);
            skipped.extend(left_alone);

            if batch.examined < u64::from(batch_size) {
                break;
            }
        }

        metrics::record_sweeper_released(total.released_tickets);
        if total.released_tickets > 0 || total.skipped_paid > 0 {
            tracing::info!(
                released = total.released_tickets,
                expired_sales = total.expired_sales,
                skipped_paid = total.skipped_paid,
                "Expiry sweep finished"
            );
        } else {
            tracing::debug!("Expiry sweep found nothing to reclaim");
        }
        Ok(total)
    }

    /// Reclaim up to `limit` lapsed holds inside `tx`.
    pub(crate) async fn reclaim_expired_in(
        &self,
        tx: &mut dyn RaffleTx,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<SweepReport> {
        self.reclaim_batch_in(tx, now, &[], limit)
            .await
            .map(|(report, _)| report)
    }

    /// One sweep batch. Also returns the sales whose lapsed holds were left
    /// in place, so the caller can step past them.
    async fn reclaim_batch_in(
        &self,
        tx: &mut dyn RaffleTx,
        now: DateTime<Utc>,
        exclude: &[SaleId],
        limit: u32,
    ) -> Result<(SweepReport, Vec<SaleId>)> {
        let expired = tx.expired_reservations(now, exclude, limit).await?;
        let mut report = SweepReport {
            examined: expired.len() as u64,
            ..SweepReport::default()
        };
        let mut left_alone = Vec::new();

        let mut orphans: Vec<Ticket> = Vec::new();
        let mut by_sale: BTreeMap<SaleId, Vec<Ticket>> = BTreeMap::new();
        for ticket in expired {
            match ticket.sale_id {
                Some(sale_id) => by_sale.entry(sale_id).or_default().push(ticket),
                None => orphans.push(ticket),
            }
        }

        for (sale_id, tickets) in by_sale {
            let Some(sale) = tx.get_sale(sale_id, true).await? else {
                orphans.extend(tickets);
                continue;
            };
            match sale.status {
                SaleStatus::Paid => {
                    tracing::warn!(
                        %sale_id,
                        numbers = ?tickets.iter().map(|t| t.number).collect::<Vec<_>>(),
                        "PAID sale still has RESERVED tickets, leaving them for repair"
                    );
                    report.skipped_paid += tickets.len() as u64;
                    left_alone.push(sale_id);
                }
                SaleStatus::Pending => {
                    let held = tx.tickets_for_sale(sale_id, &[TicketStatus::Reserved]).await?;
                    if held.iter().any(|t| t.is_live_hold(now)) {
                        tracing::debug!(%sale_id, "Sale still has live holds, not expiring yet");
                        left_alone.push(sale_id);
                        continue;
                    }
                    self.close_pending_sale_in(tx, sale, SaleStatus::Expired, now).await?;
                    report.released_tickets += held.len() as u64;
                    report.expired_sales += 1;
                }
                SaleStatus::Canceled | SaleStatus::Expired => orphans.extend(tickets),
            }
        }

        for ticket in &mut orphans {
            ticket.release();
        }
        tx.save_tickets(&orphans).await?;
        report.released_tickets += orphans.len() as u64;

        Ok((report, left_alone))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::sale::{CreateSaleRequest, TicketSelection};
    use crate::testkit::{buyer, engine_with, n};
    use raffle_core::environment::Clock;
    use raffle_core::{SaleStatus, SessionId, TicketStatus};
    use raffle_testing::InMemoryRaffleStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_releases_lapsed_holds_and_expires_pending_sales() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 30);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        engine.reserve_numbers(&[n(1)], &SessionId::new("S1")).await.unwrap();
        let sale = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("S2"),
                selection: TicketSelection::Explicit(vec![n(2), n(3)]),
            })
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(10 * 60 + 1));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.released_tickets, 3);
        assert_eq!(report.expired_sales, 1);
        assert_eq!(store.sale(sale.id).await.unwrap().status, SaleStatus::Expired);
        for number in [n(1), n(2), n(3)] {
            let ticket = store.ticket(raffle.id, number).await.unwrap();
            assert_eq!(ticket.status, TicketStatus::Available);
            assert_eq!(ticket.sale_id, None);
        }
    }

    #[tokio::test]
    async fn test_sweep_ignores_live_holds() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 30);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_numbers(&[n(4)], &SessionId::new("S1")).await.unwrap();

        fx.clock.advance(Duration::from_secs(9 * 60));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.released_tickets, 0);
        assert_eq!(engine.count_by_status(TicketStatus::Reserved).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_never_touches_a_paid_sale() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 30);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("S1"),
                selection: TicketSelection::Explicit(vec![n(5)]),
            })
            .await
            .unwrap();

        // Simulate a crash after the sale flipped to PAID but before promotion
        let mut paid = store.sale(sale.id).await.unwrap();
        paid.status = SaleStatus::Paid;
        store.put_sale(paid).await;

        fx.clock.advance(Duration::from_secs(3600));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.released_tickets, 0);
        assert_eq!(report.skipped_paid, 1);
        let ticket = store.ticket(raffle.id, n(5)).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Reserved);
        assert_eq!(ticket.sale_id, Some(sale.id));
        assert_eq!(store.sale(sale.id).await.unwrap().status, SaleStatus::Paid);
    }

    #[tokio::test]
    async fn test_sweep_walks_every_batch() {
        let store = InMemoryRaffleStore::new();
        let (mut engine, fx) = engine_with(&store, 40);
        engine.settings.sweep_batch_size = 7;
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_random(25, &SessionId::new("S1")).await.unwrap();

        fx.clock.advance(Duration::from_secs(11 * 60));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.released_tickets, 25);
        assert_eq!(engine.count_by_status(TicketStatus::Available).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_sweep_reaches_holds_behind_a_full_batch_of_paid_holds() {
        let store = InMemoryRaffleStore::new();
        let (mut engine, fx) = engine_with(&store, 40);
        engine.settings.sweep_batch_size = 5;
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let numbers: Vec<_> = (1..=6).map(n).collect();
        let sale = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("A"),
                selection: TicketSelection::Explicit(numbers),
            })
            .await
            .unwrap();
        let mut paid = store.sale(sale.id).await.unwrap();
        paid.status = SaleStatus::Paid;
        store.put_sale(paid).await;

        fx.clock.advance(Duration::from_secs(1));
        engine.reserve_numbers(&[n(20)], &SessionId::new("B")).await.unwrap();

        fx.clock.advance(Duration::from_secs(3600));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.skipped_paid, 5);
        assert_eq!(report.released_tickets, 1);
        assert_eq!(store.ticket(raffle.id, n(20)).await.unwrap().status, TicketStatus::Available);
        for value in 1..=6 {
            assert_eq!(store.ticket(raffle.id, n(value)).await.unwrap().status, TicketStatus::Reserved);
        }
    }

    #[tokio::test]
    async fn test_sweep_steps_past_a_pending_sale_with_live_holds() {
        let store = InMemoryRaffleStore::new();
        let (mut engine, fx) = engine_with(&store, 40);
        engine.settings.sweep_batch_size = 2;
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("A"),
                selection: TicketSelection::Explicit(vec![n(1), n(2), n(3)]),
            })
            .await
            .unwrap();

        // Hold on ticket 3 renewed so the sale keeps one live hold
        let mut renewed = store.ticket(raffle.id, n(3)).await.unwrap();
        renewed.reserved_until = Some(fx.clock.now() + chrono::Duration::hours(2));
        store.put_ticket(renewed).await;

        fx.clock.advance(Duration::from_secs(1));
        engine.reserve_numbers(&[n(30), n(31)], &SessionId::new("B")).await.unwrap();

        fx.clock.advance(Duration::from_secs(11 * 60));
        let report = engine.sweep_expired().await.unwrap();

        assert_eq!(report.released_tickets, 2);
        assert_eq!(report.expired_sales, 0);
        assert_eq!(store.sale(sale.id).await.unwrap().status, SaleStatus::Pending);
        for number in [n(30), n(31)] {
            assert_eq!(store.ticket(raffle.id, number).await.unwrap().status, TicketStatus::Available);
        }
        for number in [n(1), n(2), n(3)] {
            assert_eq!(store.ticket(raffle.id, number).await.unwrap().status, TicketStatus::Reserved);
        }
    }
}
