//! Snapshot recovery: every PAID sale resolves to a definitive list of numbers.
//!
//! Tiers are tried in order, first hit wins:
//!
//! 1. **Snapshot**: `ticket_numbers` already written. Pure, no writes.
//! 2. **Promotion**: upsert every `requested_numbers` ticket and link it to
//!    the sale, SOLD for a PAID sale and RESERVED for a PENDING one. For a
//!    PAID sale the final snapshot is then written from the SOLD set.
//! 3. **Linked tickets**: with no requested evidence, use whatever tickets
//!    already point at the sale, promoting RESERVED ones when PAID.
//!
//! When no tier produces numbers the sale is a ghost: the unit of work is
//! rolled back and [`EngineError::GhostSale`] is returned. Running the chain
//! again is always safe.

use crate::engine::{RaffleEngine, settle};
use crate::metrics;
use crate::sale::load_sale_in;
use chrono::{DateTime, Utc};
use raffle_core::{
    EngineError, RaffleTx, Result, Sale, SaleId, SaleStatus, Ticket, TicketStatus, snapshot_of,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::timeout;

/// Tier that resolved a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier {
    /// `ticket_numbers` was already written
    Snapshot,
    /// Rebuilt from `requested_numbers`
    Promotion,
    /// Rebuilt from tickets already linked to the sale
    LinkedTickets,
}

impl RecoveryTier {
    /// Metric and log label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Promotion => "promotion",
            Self::LinkedTickets => "linked_tickets",
        }
    }
}

/// Result of running the recovery chain on one sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Sale recovered
    pub sale_id: SaleId,
    /// Tier that produced the numbers
    pub tier: RecoveryTier,
    /// Padded, sorted numbers the sale owns (or holds, while PENDING)
    pub ticket_numbers: Vec<String>,
    /// Whether any ticket or the sale snapshot was written
    pub wrote: bool,
}

/// Tier 1. Returns the stored snapshot when there is one.
#[must_use]
pub fn snapshot_tier(sale: &Sale) -> Option<Vec<String>> {
    (!sale.ticket_numbers.is_empty()).then(|| sale.ticket_numbers.clone())
}

struct TierHit {
    numbers: Vec<String>,
    wrote: bool,
}

impl RaffleEngine {
    /// Run the recovery chain for one sale and persist what it repaired.
    ///
    /// PAID sales end with a non-empty `ticket_numbers` equal to their SOLD
    /// tickets. PENDING sales get their holds re-established. CANCELED and
    /// EXPIRED sales are refused.
    ///
    /// # Errors
    ///
    /// - [`EngineError::GhostSale`] when no tier resolves the sale; the
    ///   failure is logged at error level and recorded on the sale
    /// - [`EngineError::AvailabilityConflict`] when a PENDING sale's numbers
    ///   were taken by someone else
    /// - [`EngineError::InvalidTransition`], [`EngineError::NotFound`],
    ///   storage errors, timeouts
    #[tracing::instrument(skip(self))]
    pub async fn repair_sale(&self, sale_id: SaleId) -> Result<RecoveryOutcome> {
        let budget = self.timeout_for(self.get_sale(sale_id).await?.requested_numbers.len());

        let result = self
            .with_conflict_retry("repair_sale", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(budget, async {
                    let mut sale = load_sale_in(tx.as_mut(), sale_id, true).await?;
                    if matches!(sale.status, SaleStatus::Canceled | SaleStatus::Expired) {
                        return Err(EngineError::InvalidTransition {
                            sale_id,
                            from: sale.status,
                            action: "repair",
                        });
                    }
                    let recovered = self.recover_in(tx.as_mut(), &mut sale, now).await?;
                    if recovered.wrote {
                        sale.updated_at = now;
                        tx.update_sale(&sale).await?;
                    }
                    Ok(recovered)
                })
                .await;
                settle(tx, outcome, "repair_sale").await
            })
            .await;

        match result {
            Ok(recovered) => {
                metrics::record_recovery(recovered.tier.label());
                tracing::info!(
                    tier = recovered.tier.label(),
                    numbers = ?recovered.ticket_numbers,
                    wrote = recovered.wrote,
                    "Sale recovered"
                );
                Ok(recovered)
            }
            Err(err) => {
                if matches!(err, EngineError::GhostSale { .. }) {
                    self.report_ghost(&err).await;
                }
                Err(err)
            }
        }
    }

    /// Run tiers 1 to 3 against `sale` inside `tx`.
    ///
    /// Mutates `sale.ticket_numbers` when a snapshot is produced; the caller
    /// writes the sale. Tickets are written through `tx`.
    pub(crate) async fn recover_in(
        &self,
        tx: &mut dyn RaffleTx,
        sale: &mut Sale,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome> {
        let sale_id = sale.id;
        let hit = move |tier, hit: TierHit| RecoveryOutcome {
            sale_id,
            tier,
            ticket_numbers: hit.numbers,
            wrote: hit.wrote,
        };

        if let Some(numbers) = snapshot_tier(sale) {
            return Ok(hit(RecoveryTier::Snapshot, TierHit { numbers, wrote: false }));
        }
        if let Some(found) = self.promotion_tier_in(tx, sale, now).await? {
            return Ok(hit(RecoveryTier::Promotion, found));
        }
        if let Some(found) = self.linked_tier_in(tx, sale, now).await? {
            return Ok(hit(RecoveryTier::LinkedTickets, found));
        }

        Err(EngineError::GhostSale {
            sale_id: sale.id,
            requested: sale.requested_numbers.clone(),
            linked: Vec::new(),
        })
    }

    /// Tier 2. `None` when the sale carries no requested numbers.
    async fn promotion_tier_in(
        &self,
        tx: &mut dyn RaffleTx,
        sale: &mut Sale,
        now: DateTime<Utc>,
    ) -> Result<Option<TierHit>> {
        let requested = sale.requested()?;
        if requested.is_empty() {
            return Ok(None);
        }
        let tickets = tx.lock_numbers(sale.raffle_id, &requested).await?;

        if sale.status == SaleStatus::Paid {
            self.promote_sold(tx, sale, tickets, now).await.map(Some)
        } else {
            self.promote_reserved(tx, sale, tickets, now).await.map(Some)
        }
    }

    async fn promote_sold(
        &self,
        tx: &mut dyn RaffleTx,
        sale: &mut Sale,
        tickets: Vec<Ticket>,
        now: DateTime<Utc>,
    ) -> Result<TierHit> {
        let mut taken_elsewhere = Vec::new();
        let mut promoted = Vec::new();
        for mut ticket in tickets {
            match (ticket.status, ticket.sale_id) {
                (TicketStatus::Sold, Some(owner)) if owner == sale.id => continue,
                (TicketStatus::Sold, _) => taken_elsewhere.push(ticket.number),
                (TicketStatus::Reserved, owner) if owner != Some(sale.id) => {
                    tracing::warn!(
                        sale_id = %sale.id,
                        number = %ticket.number,
                        holder = ?owner,
                        "Paid sale takes over a ticket held by someone else"
                    );
                    ticket.sell(sale.id, now);
                    promoted.push(ticket);
                }
                _ => {
                    ticket.sell(sale.id, now);
                    promoted.push(ticket);
                }
            }
        }

        if !taken_elsewhere.is_empty() {
            let linked = tx.tickets_for_sale(sale.id, &[TicketStatus::Sold]).await?;
            tracing::error!(
                sale_id = %sale.id,
                sold_elsewhere = ?taken_elsewhere,
                "Requested numbers are SOLD to another sale"
            );
            return Err(EngineError::GhostSale {
                sale_id: sale.id,
                requested: sale.requested_numbers.clone(),
                linked: sorted_snapshot(&linked),
            });
        }

        tx.save_tickets(&promoted).await?;
        let linked = sorted_snapshot(&tx.tickets_for_sale(sale.id, &[TicketStatus::Sold]).await?);

        let linked_set: BTreeSet<&String> = linked.iter().collect();
        if sale.requested_numbers.iter().any(|n| !linked_set.contains(n)) {
            return Err(EngineError::GhostSale {
                sale_id: sale.id,
                requested: sale.requested_numbers.clone(),
                linked,
            });
        }

        let wrote = !promoted.is_empty() || sale.ticket_numbers != linked;
        sale.ticket_numbers.clone_from(&linked);
        Ok(TierHit { numbers: linked, wrote })
    }

    async fn promote_reserved(
        &self,
        tx: &mut dyn RaffleTx,
        sale: &Sale,
        tickets: Vec<Ticket>,
        now: DateTime<Utc>,
    ) -> Result<TierHit> {
        let mut conflicts = Vec::new();
        let mut relinked = Vec::new();
        for mut ticket in tickets {
            let ours = ticket.sale_id == Some(sale.id);
            let free = ticket.status == TicketStatus::Available
                || (ticket.is_expired_hold(now) && ticket.sale_id.is_none());
            if ours && ticket.status == TicketStatus::Reserved {
                continue;
            }
            if ours || free {
                ticket.reserve(None, Some(sale.id), self.hold_until(now));
                relinked.push(ticket);
            } else {
                conflicts.push(ticket.number);
            }
        }

        if !conflicts.is_empty() {
            return Err(EngineError::AvailabilityConflict { numbers: conflicts });
        }
        tx.save_tickets(&relinked).await?;
        Ok(TierHit {
            numbers: sale.requested_numbers.clone(),
            wrote: !relinked.is_empty(),
        })
    }

    /// Tier 3. `None` when nothing points at the sale.
    async fn linked_tier_in(
        &self,
        tx: &mut dyn RaffleTx,
        sale: &mut Sale,
        now: DateTime<Utc>,
    ) -> Result<Option<TierHit>> {
        let mut linked = tx
            .tickets_for_sale(sale.id, &[TicketStatus::Sold, TicketStatus::Reserved])
            .await?;
        if linked.is_empty() {
            return Ok(None);
        }
        if sale.status != SaleStatus::Paid {
            return Ok(Some(TierHit {
                numbers: sorted_snapshot(&linked),
                wrote: false,
            }));
        }

        let mut promoted = Vec::new();
        for ticket in &mut linked {
            if ticket.status == TicketStatus::Reserved {
                ticket.sell(sale.id, now);
                promoted.push(ticket.clone());
            }
        }
        tx.save_tickets(&promoted).await?;

        let numbers = sorted_snapshot(&linked);
        sale.ticket_numbers.clone_from(&numbers);
        Ok(Some(TierHit { numbers, wrote: true }))
    }

    /// Log a ghost sale loudly, count it and record it on the sale.
    pub(crate) async fn report_ghost(&self, err: &EngineError) {
        let EngineError::GhostSale {
            sale_id,
            requested,
            linked,
        } = err
        else {
            return;
        };
        tracing::error!(
            %sale_id,
            requested = ?requested,
            linked = ?linked,
            "GHOST SALE: no recovery tier could resolve the sale, manual repair required"
        );
        metrics::record_ghost_sale();
        self.record_sale_error(*sale_id, err.to_string()).await;
    }
}

fn sorted_snapshot(tickets: &[Ticket]) -> Vec<String> {
    let mut numbers: Vec<_> = tickets.iter().map(|t| t.number).collect();
    numbers.sort_unstable();
    numbers.dedup();
    snapshot_of(&numbers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sale::{CreateSaleRequest, TicketSelection};
    use crate::testkit::{buyer, engine_with, n};
    use raffle_core::SessionId;
    use raffle_testing::InMemoryRaffleStore;

    async fn sale_for(engine: &RaffleEngine, numbers: &[u32]) -> Sale {
        engine
            .create_sale(CreateSaleRequest {
                customer: buyer(),
                session_id: SessionId::new("S1"),
                selection: TicketSelection::Explicit(numbers.iter().map(|v| n(*v)).collect()),
            })
            .await
            .unwrap()
    }

    async fn mark_paid(store: &InMemoryRaffleStore, sale_id: SaleId) {
        let mut sale = store.sale(sale_id).await.unwrap();
        sale.status = SaleStatus::Paid;
        store.put_sale(sale).await;
    }

    #[test]
    fn test_snapshot_tier_is_pure() {
        let raffle = raffle_core::Raffle::new("r", 10, 100, "USD", Utc::now());
        let mut sale = Sale::pending(SaleId::new(), &raffle, raffle_core::CustomerId::new(), &[n(1)], Utc::now());
        assert_eq!(snapshot_tier(&sale), None);
        sale.ticket_numbers = vec!["0001".into()];
        assert_eq!(snapshot_tier(&sale), Some(vec!["0001".to_string()]));
    }

    #[tokio::test]
    async fn test_promotion_rebuilds_deleted_rows() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[1, 2]).await;
        mark_paid(&store, sale.id).await;
        store.delete_tickets(raffle.id, &[n(1), n(2)]).await;

        let recovered = engine.repair_sale(sale.id).await.unwrap();

        assert_eq!(recovered.tier, RecoveryTier::Promotion);
        assert_eq!(recovered.ticket_numbers, vec!["0001", "0002"]);
        assert!(recovered.wrote);
        assert_eq!(store.sale(sale.id).await.unwrap().ticket_numbers, vec!["0001", "0002"]);
        for number in [n(1), n(2)] {
            let ticket = store.ticket(raffle.id, number).await.unwrap();
            assert_eq!(ticket.status, TicketStatus::Sold);
            assert_eq!(ticket.sale_id, Some(sale.id));
        }
    }

    #[tokio::test]
    async fn test_second_repair_hits_the_snapshot_without_writing() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[4]).await;
        mark_paid(&store, sale.id).await;
        engine.repair_sale(sale.id).await.unwrap();
        let before = store.sale(sale.id).await.unwrap();

        let again = engine.repair_sale(sale.id).await.unwrap();

        assert_eq!(again.tier, RecoveryTier::Snapshot);
        assert!(!again.wrote);
        assert_eq!(store.sale(sale.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_linked_tier_promotes_reserved_tickets_of_a_paid_sale() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[6, 7]).await;

        let mut legacy = store.sale(sale.id).await.unwrap();
        legacy.status = SaleStatus::Paid;
        legacy.requested_numbers.clear();
        store.put_sale(legacy).await;

        let recovered = engine.repair_sale(sale.id).await.unwrap();

        assert_eq!(recovered.tier, RecoveryTier::LinkedTickets);
        assert_eq!(recovered.ticket_numbers, vec!["0006", "0007"]);
        let ticket = store.ticket(raffle.id, n(7)).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Sold);
    }

    #[tokio::test]
    async fn test_ghost_sale_is_reported_and_nothing_is_written() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[3]).await;

        let mut ghost = store.sale(sale.id).await.unwrap();
        ghost.status = SaleStatus::Paid;
        ghost.requested_numbers.clear();
        store.put_sale(ghost).await;
        store.delete_tickets(raffle.id, &[n(3)]).await;

        let err = engine.repair_sale(sale.id).await.unwrap_err();

        assert_eq!(err.code(), "GHOST_SALE");
        let stored = store.sale(sale.id).await.unwrap();
        assert!(stored.ticket_numbers.is_empty());
        assert!(stored.last_error.unwrap().contains("Ghost sale"));
    }

    #[tokio::test]
    async fn test_number_sold_to_another_sale_is_a_ghost() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[9]).await;
        mark_paid(&store, sale.id).await;

        let mut stolen = store.ticket(raffle.id, n(9)).await.unwrap();
        stolen.sell(SaleId::new(), Utc::now());
        store.put_ticket(stolen).await;

        let err = engine.repair_sale(sale.id).await.unwrap_err();

        assert!(matches!(err, EngineError::GhostSale { ref requested, .. } if requested == &["0009"]));
    }

    #[tokio::test]
    async fn test_repair_of_pending_sale_restores_holds() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        let raffle = engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[10, 11]).await;
        store.delete_tickets(raffle.id, &[n(11)]).await;

        let recovered = engine.repair_sale(sale.id).await.unwrap();

        assert_eq!(recovered.tier, RecoveryTier::Promotion);
        assert_eq!(recovered.ticket_numbers, vec!["0010", "0011"]);
        let ticket = store.ticket(raffle.id, n(11)).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Reserved);
        assert_eq!(ticket.sale_id, Some(sale.id));
        assert_eq!(store.sale(sale.id).await.unwrap().status, SaleStatus::Pending);
    }

    #[tokio::test]
    async fn test_canceled_sale_is_not_repaired() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        let sale = sale_for(&engine, &[12]).await;
        engine.cancel_sale(sale.id).await.unwrap();

        let err = engine.repair_sale(sale.id).await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidTransition { action: "repair", .. }));
    }
}
