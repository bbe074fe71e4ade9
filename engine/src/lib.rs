//! Raffle Engine - ticket inventory and sale reconciliation
//!
//! Sells numbered tickets from a fixed pool (0001..=N) and keeps ticket
//! ownership consistent with what the payment gateway says happened.
//!
//! # Architecture
//!
//! ```text
//!            buyer                 gateway callback          background jobs
//!              │                          │                        │
//!              ▼                          ▼                        ▼
//!   reserve / create_sale  ──►  confirm_payment  ◄──  sweep_expired / reconcile_stale
//!              │                          │                        │
//!              └──────────────┬───────────┴────────────────────────┘
//!                             ▼
//!                      RaffleEngine (stateless)
//!                             │  one transaction per unit of work
//!                             ▼
//!                        RaffleStore (PostgreSQL / in-memory)
//! ```
//!
//! # Key Features
//!
//! ## 1. No Double Sale
//!
//! Every pick runs under row locks inside a serializable transaction. Two
//! buyers racing for the same number: one wins, the other gets
//! [`EngineError::AvailabilityConflict`](raffle_core::EngineError) listing
//! every offending number.
//!
//! ## 2. Hold Expiry
//!
//! A reservation lives for a fixed hold window. Lapsed holds can be taken
//! over by any buyer and are reclaimed in batches by the sweeper, which
//! also expires the PENDING sales that owned them.
//!
//! ## 3. Three-Tier Recovery
//!
//! A PAID sale's ticket list is rebuilt from the first source that answers:
//!
//! ```text
//! 1. snapshot       sale.ticket_numbers, if non-empty
//! 2. promotion      re-sell sale.requested_numbers, recreating missing rows
//! 3. linked_tickets tickets whose sale link points at this sale
//! otherwise         ghost sale, flagged for an operator
//! ```
//!
//! # Usage
//!
//! Build a [`RaffleEngine`] from a store, a [`PaymentGateway`], a [`Mailer`]
//! and a clock, then call operations on it. The `raffle-worker` binary wires
//! the production collaborators and runs the periodic jobs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod config;
pub mod email;
pub mod engine;
pub mod gateway;
pub mod inventory;
pub mod jobs;
pub mod metrics;
pub mod payment;
pub mod reconciliation;
pub mod recovery;
pub mod reservation;
pub mod sale;
pub mod sweeper;

pub use admin::{AuditFinding, AuditProblem, ManualRelease};
pub use config::Config;
pub use email::{LogMailer, MailError, Mailer, MockMailer, TicketsEmail};
pub use engine::{EngineSettings, RaffleEngine};
pub use gateway::http::{GatewayConfig, HttpPaymentGateway};
pub use gateway::mock::MockPaymentGateway;
pub use gateway::resilient::ResilientGateway;
pub use gateway::{
    ConfirmRequest, ConfirmResponse, GatewayError, PaymentGateway, PaymentStatus, PrepareRequest,
    PrepareResponse,
};
pub use inventory::Availability;
pub use jobs::{ExpirySweepJob, JobRunner, ScheduledJob, StaleReconcileJob};
pub use payment::PreparedPayment;
pub use reconciliation::{
    ConfirmCallback, ConfirmOutcome, EmailDelivery, ReconcileOutcome, ReconcileReport,
};
pub use recovery::{RecoveryOutcome, RecoveryTier, snapshot_tier};
pub use reservation::{ReleaseReport, Reservation};
pub use sale::{CreateSaleRequest, TicketSelection};
pub use sweeper::SweepReport;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testkit {
    use crate::{EngineSettings, MockMailer, MockPaymentGateway, RaffleEngine};
    use raffle_core::{NewCustomer, TicketNumber};
    use raffle_testing::{InMemoryRaffleStore, ManualClock};
    use std::sync::Arc;

    /// Handles on the collaborators behind a test engine.
    pub struct Fixtures {
        pub gateway: MockPaymentGateway,
        pub mailer: MockMailer,
        pub clock: Arc<ManualClock>,
    }

    pub fn n(value: u32) -> TicketNumber {
        TicketNumber::new(value).unwrap()
    }

    pub fn buyer() -> NewCustomer {
        NewCustomer {
            id_number: "0912345678".into(),
            full_name: "Ana Torres".into(),
            email: "ana@example.com".into(),
            phone: None,
        }
    }

    /// Engine over `store` whose raffle has tickets 1..=`max` at 100 each.
    pub fn engine_with(store: &InMemoryRaffleStore, max: u16) -> (RaffleEngine, Fixtures) {
        let gateway = MockPaymentGateway::new();
        let mailer = MockMailer::new();
        let clock = Arc::new(ManualClock::new());
        let settings = EngineSettings {
            max_number: max,
            unit_price: 100,
            ..EngineSettings::default()
        };
        let engine = RaffleEngine::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(mailer.clone()),
            clock.clone(),
            settings,
        );
        (
            engine,
            Fixtures {
                gateway,
                mailer,
                clock,
            },
        )
    }
}
