//! The engine handle and the unit-of-work plumbing every operation shares.
//!
//! Operations live in their own modules as `impl RaffleEngine` blocks. Each
//! public operation follows the same shape:
//!
//! 1. validate input before any transaction opens,
//! 2. open a transaction and run the work under a bounded timeout,
//! 3. commit on success, roll back on error or timeout,
//! 4. re-run the whole unit of work when the store reports a serialization
//!    conflict, up to `max_conflict_retries` times.

use crate::email::Mailer;
use crate::gateway::PaymentGateway;
use raffle_core::environment::Clock;
use raffle_core::{EngineError, RaffleStore, RaffleTx, Result};
use raffle_runtime::{RetryPolicy, retry_with_predicate};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Tickets per pick above which the bulk transaction budget applies.
pub const BULK_PICK_THRESHOLD: u32 = 500;

/// Tunables for engine operations.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Name given to a raffle created at startup
    pub raffle_name: String,
    /// Highest ticket number of a newly created raffle
    pub max_number: u16,
    /// Ticket price in minor units for a newly created raffle
    pub unit_price: i64,
    /// Currency for a newly created raffle
    pub currency: String,
    /// How long a reservation hold lasts
    pub hold_duration: Duration,
    /// Upper bound on tickets in one sale
    pub max_tickets_per_sale: u32,
    /// Budget for ordinary units of work
    pub tx_timeout: Duration,
    /// Budget for seeding, resets, sweeps and bulk picks
    pub bulk_tx_timeout: Duration,
    /// Re-runs after a serialization conflict
    pub max_conflict_retries: usize,
    /// Expired holds handled per sweep transaction
    pub sweep_batch_size: u32,
    /// Stale PENDING sales examined per reconcile run
    pub reconcile_batch_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            raffle_name: "Raffle".to_string(),
            max_number: raffle_core::MAX_TICKET_NUMBER,
            unit_price: 100,
            currency: "USD".to_string(),
            hold_duration: Duration::from_secs(10 * 60),
            max_tickets_per_sale: 5000,
            tx_timeout: Duration::from_secs(15),
            bulk_tx_timeout: Duration::from_secs(30),
            max_conflict_retries: 3,
            sweep_batch_size: 500,
            reconcile_batch_size: 50,
        }
    }
}

/// Ticket inventory and sale reconciliation engine.
///
/// Holds no ticket or sale state of its own: every operation reads and
/// writes through the [`RaffleStore`]. Cloning is cheap.
#[derive(Clone)]
pub struct RaffleEngine {
    pub(crate) store: Arc<dyn RaffleStore>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
}

impl std::fmt::Debug for RaffleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaffleEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RaffleEngine {
    /// Assemble an engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn RaffleStore>,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            mailer,
            clock,
            settings,
        }
    }

    /// Current settings
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Transaction budget for a pick of `count` tickets.
    pub(crate) const fn timeout_for(&self, count: usize) -> Duration {
        if count >= BULK_PICK_THRESHOLD as usize {
            self.settings.bulk_tx_timeout
        } else {
            self.settings.tx_timeout
        }
    }

    pub(crate) fn hold_until(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        let hold = chrono::Duration::from_std(self.settings.hold_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        now + hold
    }

    /// Re-run `operation` while it fails with [`EngineError::ConcurrencyConflict`].
    ///
    /// `operation` must open and settle its own transaction on every call.
    pub(crate) async fn with_conflict_retry<T, F, Fut>(&self, op: &'static str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::builder()
            .max_retries(self.settings.max_conflict_retries)
            .initial_delay(Duration::from_millis(20))
            .max_delay(Duration::from_millis(500))
            .multiplier(2.0)
            .build();

        let result = retry_with_predicate(&policy, operation, |err: &EngineError| {
            matches!(err, EngineError::ConcurrencyConflict)
        })
        .await;

        if matches!(result, Err(EngineError::ConcurrencyConflict)) {
            tracing::warn!(op, "Concurrency conflict persisted, reporting system busy");
        }
        result
    }
}

/// Commit or roll back `tx` according to how its work finished.
///
/// # Errors
///
/// Returns the work's error, [`EngineError::Timeout`] if the budget
/// elapsed, or the commit error.
pub(crate) async fn settle<T>(
    tx: Box<dyn RaffleTx>,
    outcome: std::result::Result<Result<T>, Elapsed>,
    op: &'static str,
) -> Result<T> {
    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(op, error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
        Err(_) => {
            tracing::warn!(op, "Transaction exceeded its time budget, rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(op, error = %rollback_err, "Rollback failed");
            }
            Err(EngineError::Timeout(op))
        }
    }
}
