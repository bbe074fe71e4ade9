//! Shared setup for engine integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use raffle_core::{NewCustomer, SessionId, TicketNumber, TicketStatus};
use raffle_engine::{EngineSettings, MockMailer, MockPaymentGateway, RaffleEngine};
use raffle_testing::{InMemoryRaffleStore, ManualClock};
use std::sync::Arc;

/// An engine over an in-memory store plus handles on its collaborators.
pub struct TestRaffle {
    pub engine: RaffleEngine,
    pub store: InMemoryRaffleStore,
    pub gateway: MockPaymentGateway,
    pub mailer: MockMailer,
    pub clock: Arc<ManualClock>,
}

impl TestRaffle {
    /// Raffle with tickets 1..=`max` at 100 each, already seeded.
    pub async fn with_max(max: u16) -> Self {
        Self::with_settings(EngineSettings {
            max_number: max,
            unit_price: 100,
            ..EngineSettings::default()
        })
        .await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        let store = InMemoryRaffleStore::new();
        let gateway = MockPaymentGateway::new();
        let mailer = MockMailer::new();
        let clock = Arc::new(ManualClock::new());
        let engine = RaffleEngine::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(mailer.clone()),
            clock.clone(),
            settings,
        );
        engine.ensure_active_raffle().await.unwrap();
        Self {
            engine,
            store,
            gateway,
            mailer,
            clock,
        }
    }

    /// Counts of (available, reserved, sold) read straight from the store.
    pub async fn census(&self) -> (usize, usize, usize) {
        let raffle = self.engine.ensure_active_raffle().await.unwrap();
        let tickets = self.store.tickets(raffle.id).await;
        let count = |status| tickets.iter().filter(|t| t.status == status).count();
        (
            count(TicketStatus::Available),
            count(TicketStatus::Reserved),
            count(TicketStatus::Sold),
        )
    }
}

pub fn n(value: u32) -> TicketNumber {
    TicketNumber::new(value).unwrap()
}

pub fn numbers(values: &[u32]) -> Vec<TicketNumber> {
    values.iter().copied().map(n).collect()
}

pub fn session(id: &str) -> SessionId {
    SessionId::new(id)
}

pub fn buyer(id_number: &str) -> NewCustomer {
    NewCustomer {
        id_number: id_number.to_string(),
        full_name: format!("Buyer {id_number}"),
        email: format!("buyer{id_number}@example.com"),
        phone: None,
    }
}
