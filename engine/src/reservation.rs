//! Reservation manager: time-boxed holds on tickets.
//!
//! A hold is a RESERVED ticket carrying the buyer's session and/or the
//! PENDING sale it was reserved for, plus `reserved_until`. Every check and
//! write for one call happens inside a single transaction, on rows locked by
//! that transaction, so two buyers can never both believe they hold a number.

use crate::engine::{RaffleEngine, settle};
use crate::inventory::active_raffle_in;
use crate::metrics;
use chrono::{DateTime, Utc};
use raffle_core::{
    EngineError, Raffle, RaffleId, RaffleTx, Result, Sale, SaleId, SaleStatus, SessionId,
    TicketNumber, TicketStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::timeout;

/// A successful hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Raffle the numbers belong to
    pub raffle_id: RaffleId,
    /// Session holding the tickets
    pub session_id: SessionId,
    /// Held numbers, sorted
    pub numbers: Vec<TicketNumber>,
    /// When the hold lapses
    pub reserved_until: DateTime<Utc>,
}

/// Outcome of a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReport {
    /// Numbers returned to AVAILABLE
    pub released: Vec<TicketNumber>,
    /// Numbers left untouched: not held by the session, or tied to a PENDING sale
    pub skipped: Vec<TicketNumber>,
}

impl RaffleEngine {
    /// Hold `count` random AVAILABLE tickets for `session`.
    ///
    /// Lapsed holds are reclaimed first. Fails without holding anything when
    /// fewer than `count` tickets can be claimed.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for a zero count or one above the per-sale limit
    /// - [`EngineError::InsufficientInventory`] with the number actually found
    /// - [`EngineError::NoActiveRaffle`], storage errors, timeouts
    #[tracing::instrument(skip(self), fields(session_id = %session))]
    pub async fn reserve_random(&self, count: u32, session: &SessionId) -> Result<Reservation> {
        self.validate_count(count)?;
        validate_session(session)?;

        let budget = self.timeout_for(count as usize);
        let reservation = self
            .with_conflict_retry("reserve_random", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(budget, async {
                    let raffle = active_raffle_in(tx.as_mut()).await?;
                    let numbers = self
                        .reserve_random_in(tx.as_mut(), &raffle, count, Some(session), None, now)
                        .await?;
                    Ok::<_, EngineError>(self.reservation(&raffle, session, numbers, now))
                })
                .await;
                settle(tx, outcome, "reserve_random").await
            })
            .await?;

        metrics::record_reservation("random", reservation.numbers.len());
        tracing::info!(count, until = %reservation.reserved_until, "Random tickets reserved");
        Ok(reservation)
    }

    /// Hold exactly `numbers` for `session`.
    ///
    /// Numbers already held by the same session are accepted as-is, so the
    /// call is idempotent. Holds that lapsed are taken over; a PENDING sale
    /// that owned one is expired.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for an empty, duplicated or out-of-range selection
    /// - [`EngineError::AvailabilityConflict`] listing every number that is SOLD
    ///   or held live by someone else
    /// - [`EngineError::NoActiveRaffle`], storage errors, timeouts
    #[tracing::instrument(skip(self, numbers), fields(session_id = %session, count = numbers.len()))]
    pub async fn reserve_numbers(&self, numbers: &[TicketNumber], session: &SessionId) -> Result<Reservation> {
        let numbers = self.validate_numbers(numbers)?;
        validate_session(session)?;

        let numbers = &numbers;
        let budget = self.timeout_for(numbers.len());
        let reservation = self
            .with_conflict_retry("reserve_numbers", move || async move {
                let mut tx = self.store.begin().await?;
                let now = self.clock.now();
                let outcome = timeout(budget, async {
                    let raffle = active_raffle_in(tx.as_mut()).await?;
                    let held = self
                        .reserve_numbers_in(tx.as_mut(), &raffle, numbers, Some(session), None, now)
                        .await?;
                    Ok::<_, EngineError>(self.reservation(&raffle, session, held, now))
                })
                .await;
                settle(tx, outcome, "reserve_numbers").await
            })
            .await?;

        metrics::record_reservation("explicit", reservation.numbers.len());
        tracing::info!(numbers = ?reservation.numbers, "Tickets reserved");
        Ok(reservation)
    }

    /// Release the session's holds on `numbers`.
    ///
    /// Only RESERVED tickets held by `session` are released. Everything else
    /// is reported as skipped, as are holds tied to a PENDING sale (those go
    /// through sale cancellation). Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an empty selection or session,
    /// [`EngineError::NoActiveRaffle`], storage errors, timeouts.
    #[tracing::instrument(skip(self, numbers), fields(session_id = %session))]
    pub async fn release(&self, numbers: &[TicketNumber], session: &SessionId) -> Result<ReleaseReport> {
        if numbers.is_empty() {
            return Err(EngineError::Validation("no ticket numbers to release".into()));
        }
        validate_session(session)?;

        let mut numbers = numbers.to_vec();
        numbers.sort_unstable();
        numbers.dedup();
        let numbers = &numbers;

        let report = self
            .with_conflict_retry("release", move || async move {
                let mut tx = self.store.begin().await?;
                let outcome = timeout(self.settings.tx_timeout, release_in(tx.as_mut(), numbers, session)).await;
                settle(tx, outcome, "release").await
            })
            .await?;

        metrics::record_release(report.released.len());
        tracing::info!(released = ?report.released, skipped = report.skipped.len(), "Tickets released");
        Ok(report)
    }

    fn reservation(&self, raffle: &Raffle, session: &SessionId, numbers: Vec<TicketNumber>, now: DateTime<Utc>) -> Reservation {
        Reservation {
            raffle_id: raffle.id,
            session_id: session.clone(),
            numbers,
            reserved_until: self.hold_until(now),
        }
    }

    pub(crate) fn validate_count(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(EngineError::Validation("ticket count must be at least 1".into()));
        }
        let limit = self.settings.max_tickets_per_sale.min(u32::from(self.settings.max_number));
        if count > limit {
            return Err(EngineError::Validation(format!(
                "ticket count {count} exceeds the limit of {limit}"
            )));
        }
        Ok(())
    }

    /// Reject empty, duplicated, oversized or out-of-range selections.
    /// Returns the numbers sorted.
    pub(crate) fn validate_numbers(&self, numbers: &[TicketNumber]) -> Result<Vec<TicketNumber>> {
        if numbers.is_empty() {
            return Err(EngineError::Validation("at least one ticket number is required".into()));
        }
        let mut sorted = numbers.to_vec();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(EngineError::Validation(format!("ticket number {} is repeated", pair[0])));
        }
        let count = u32::try_from(sorted.len()).unwrap_or(u32::MAX);
        if count > self.settings.max_tickets_per_sale {
            return Err(EngineError::Validation(format!(
                "{count} tickets exceed the limit of {}",
                self.settings.max_tickets_per_sale
            )));
        }
        if let Some(max) = sorted.last().filter(|n| n.value() > self.settings.max_number) {
            return Err(EngineError::Validation(format!(
                "ticket number {max} is above the maximum {}",
                self.settings.max_number
            )));
        }
        Ok(sorted)
    }

    /// Claim `count` random AVAILABLE tickets inside `tx`.
    pub(crate) async fn reserve_random_in(
        &self,
        tx: &mut dyn RaffleTx,
        raffle: &Raffle,
        count: u32,
        session: Option<&SessionId>,
        sale_id: Option<SaleId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TicketNumber>> {
        let reclaimed = self.reclaim_expired_in(tx, now, u32::from(raffle.max_number)).await?;
        if reclaimed.released_tickets > 0 {
            tracing::debug!(released = reclaimed.released_tickets, "Reclaimed lapsed holds before picking");
        }

        let mut claimed = tx.claim_available(raffle.id, count).await?;
        let found = u32::try_from(claimed.len()).unwrap_or(u32::MAX);
        if found < count {
            tracing::info!(requested = count, available = found, "Not enough tickets to pick");
            return Err(EngineError::InsufficientInventory {
                requested: count,
                available: found,
            });
        }

        let until = self.hold_until(now);
        for ticket in &mut claimed {
            ticket.reserve(session.cloned(), sale_id, until);
        }
        tx.save_tickets(&claimed).await?;

        let mut numbers: Vec<TicketNumber> = claimed.iter().map(|t| t.number).collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Hold exactly `numbers` inside `tx`, creating missing rows on the way.
    ///
    /// With `sale_id` set, holds the session already has are linked to the
    /// sale and refreshed. A live hold tied to a different sale conflicts.
    pub(crate) async fn reserve_numbers_in(
        &self,
        tx: &mut dyn RaffleTx,
        raffle: &Raffle,
        numbers: &[TicketNumber],
        session: Option<&SessionId>,
        sale_id: Option<SaleId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TicketNumber>> {
        raffle.check_range(numbers)?;
        let tickets = tx.lock_numbers(raffle.id, numbers).await?;

        let mut conflicts = Vec::new();
        let mut displaced: BTreeMap<SaleId, Sale> = BTreeMap::new();
        let mut claimed = Vec::new();

        for ticket in tickets {
            let take = match ticket.status {
                TicketStatus::Available => true,
                TicketStatus::Sold => false,
                TicketStatus::Reserved if ticket.is_live_hold(now) => {
                    let same_session = session.is_some_and(|s| ticket.is_reserved_by(s));
                    let same_sale = sale_id.is_some() && ticket.sale_id == sale_id;
                    if !(same_session || same_sale) {
                        false
                    } else if sale_id.is_none() || same_sale {
                        // already ours
                        continue;
                    } else {
                        ticket.sale_id.is_none()
                    }
                }
                TicketStatus::Reserved => match ticket.sale_id {
                    None => true,
                    Some(owner) if displaced.contains_key(&owner) => true,
                    Some(owner) => match tx.get_sale(owner, true).await? {
                        Some(sale) if sale.status == SaleStatus::Paid => false,
                        Some(sale) if sale.status == SaleStatus::Pending => {
                            displaced.insert(owner, sale);
                            true
                        }
                        _ => true,
                    },
                },
            };

            if take {
                claimed.push(ticket);
            } else {
                conflicts.push(ticket.number);
            }
        }

        if !conflicts.is_empty() {
            conflicts.sort_unstable();
            tracing::info!(numbers = ?conflicts, "Requested numbers are unavailable");
            return Err(EngineError::AvailabilityConflict { numbers: conflicts });
        }

        for sale in displaced.into_values() {
            tracing::info!(sale_id = %sale.id, "Hold lapsed and was taken over, expiring sale");
            self.close_pending_sale_in(tx, sale, SaleStatus::Expired, now).await?;
        }

        let until = self.hold_until(now);
        for ticket in &mut claimed {
            ticket.reserve(session.cloned(), sale_id, until);
        }
        tx.save_tickets(&claimed).await?;

        let mut held = numbers.to_vec();
        held.sort_unstable();
        held.dedup();
        Ok(held)
    }
}

async fn release_in(
    tx: &mut dyn RaffleTx,
    numbers: &[TicketNumber],
    session: &SessionId,
) -> Result<ReleaseReport> {
    let raffle = active_raffle_in(tx).await?;
    let tickets = tx.lock_numbers(raffle.id, numbers).await?;

    let mut report = ReleaseReport::default();
    let mut released = Vec::new();
    for mut ticket in tickets {
        if !ticket.is_reserved_by(session) {
            report.skipped.push(ticket.number);
            continue;
        }
        if let Some(sale_id) = ticket.sale_id {
            let pending = tx
                .get_sale(sale_id, false)
                .await?
                .is_some_and(|sale| sale.status == SaleStatus::Pending);
            if pending {
                report.skipped.push(ticket.number);
                continue;
            }
        }
        ticket.release();
        report.released.push(ticket.number);
        released.push(ticket);
    }

    tx.save_tickets(&released).await?;
    Ok(report)
}

fn validate_session(session: &SessionId) -> Result<()> {
    if session.as_str().trim().is_empty() {
        return Err(EngineError::Validation("session id is required".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testkit::{engine_with, n};
    use raffle_testing::InMemoryRaffleStore;
    use std::time::Duration;

    fn s(id: &str) -> SessionId {
        SessionId::new(id)
    }

    #[tokio::test]
    async fn test_same_session_reserve_is_idempotent() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();

        let first = engine.reserve_numbers(&[n(5), n(6)], &s("S1")).await.unwrap();
        let second = engine.reserve_numbers(&[n(6), n(5)], &s("S1")).await.unwrap();

        assert_eq!(first.numbers, second.numbers);
        assert_eq!(engine.count_by_status(TicketStatus::Reserved).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conflict_lists_every_offending_number() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_numbers(&[n(2), n(9)], &s("S1")).await.unwrap();

        let err = engine
            .reserve_numbers(&[n(9), n(1), n(2)], &s("S2"))
            .await
            .unwrap_err();

        assert_eq!(err, EngineError::AvailabilityConflict { numbers: vec![n(2), n(9)] });
        // Nothing from the failed call was held
        let one = engine.find_by_numbers(&[n(1)]).await.unwrap();
        assert_eq!(one[0].status, TicketStatus::Available);
    }

    #[tokio::test]
    async fn test_lapsed_hold_can_be_taken_over() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_numbers(&[n(3)], &s("S1")).await.unwrap();

        fx.clock.advance(Duration::from_secs(11 * 60));
        let held = engine.reserve_numbers(&[n(3)], &s("S2")).await.unwrap();

        assert_eq!(held.numbers, vec![n(3)]);
        let ticket = engine.find_by_numbers(&[n(3)]).await.unwrap().remove(0);
        assert!(ticket.is_reserved_by(&s("S2")));
    }

    #[tokio::test]
    async fn test_release_skips_foreign_and_free_tickets() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 20);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_numbers(&[n(1), n(2)], &s("S1")).await.unwrap();
        engine.reserve_numbers(&[n(3)], &s("S2")).await.unwrap();

        let report = engine.release(&[n(1), n(3), n(4)], &s("S1")).await.unwrap();

        assert_eq!(report.released, vec![n(1)]);
        assert_eq!(report.skipped, vec![n(3), n(4)]);

        let again = engine.release(&[n(1)], &s("S1")).await.unwrap();
        assert!(again.released.is_empty());
        assert_eq!(again.skipped, vec![n(1)]);
    }

    #[tokio::test]
    async fn test_random_pick_reports_shortfall_and_holds_nothing() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 10);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_random(8, &s("S1")).await.unwrap();

        let err = engine.reserve_random(5, &s("S2")).await.unwrap_err();

        assert_eq!(err, EngineError::InsufficientInventory { requested: 5, available: 2 });
        assert_eq!(engine.count_by_status(TicketStatus::Available).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_random_pick_reclaims_lapsed_holds() {
        let store = InMemoryRaffleStore::new();
        let (engine, fx) = engine_with(&store, 10);
        engine.ensure_active_raffle().await.unwrap();
        engine.reserve_random(10, &s("S1")).await.unwrap();

        fx.clock.advance(Duration::from_secs(10 * 60 + 1));
        let reservation = engine.reserve_random(4, &s("S2")).await.unwrap();

        assert_eq!(reservation.numbers.len(), 4);
        assert_eq!(engine.count_by_status(TicketStatus::Available).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_selection_validation() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 10);
        engine.ensure_active_raffle().await.unwrap();

        assert!(matches!(
            engine.reserve_numbers(&[], &s("S1")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.reserve_numbers(&[n(1), n(1)], &s("S1")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.reserve_numbers(&[n(11)], &s("S1")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.reserve_random(0, &s("S1")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.reserve_numbers(&[n(1)], &s(" ")).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_retry_reruns_the_unit_of_work() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 10);
        engine.ensure_active_raffle().await.unwrap();
        store.inject_conflicts(2);

        let held = engine.reserve_numbers(&[n(7)], &s("S1")).await.unwrap();

        assert_eq!(held.numbers, vec![n(7)]);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_as_busy() {
        let store = InMemoryRaffleStore::new();
        let (engine, _) = engine_with(&store, 10);
        engine.ensure_active_raffle().await.unwrap();
        store.inject_conflicts(10);

        let err = engine.reserve_numbers(&[n(7)], &s("S1")).await.unwrap_err();

        assert_eq!(err, EngineError::ConcurrencyConflict);
        assert!(err.user_message().contains("busy"));
    }
}
